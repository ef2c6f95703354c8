//! Carib rate limiter - distributed fixed-window rate limiting
//!
//! This crate implements the rate limiter that sits in front of the Carib
//! backend's public endpoints. Counters live in a shared `WindowStore` and
//! are updated through per-key atomic transactions, so any number of
//! process instances can enforce the same limits.

pub mod api;
pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
