//! Rate limiting logic and window storage.

mod clock;
mod limiter;
mod optimistic;
mod record;
mod rules;
mod store;
mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Decision, LimitConfig, RateLimiter, TimeWindow, REMAINING_UNKNOWN};
pub use optimistic::{
    MemoryVersionedBackend, OptimisticWindowStore, RetryPolicy, Versioned, VersionedBackend,
};
pub use record::{WindowKey, WindowRecord};
pub use rules::EndpointLimits;
pub use store::{MemoryWindowStore, Updater, WindowStore};
pub use sweeper::{sweep_until_clean, SweepConfig, Sweeper};
