//! Window keys and the per-key counter record.

use serde::{Deserialize, Serialize};

/// A key that uniquely identifies a rate limit window.
///
/// The key is composed of the caller identifier and the logical endpoint;
/// neither is unique on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// Who is being limited (caller IP, API key, principal id)
    pub identifier: String,
    /// The logical operation being limited
    pub endpoint: String,
}

impl WindowKey {
    /// Create a new window key.
    pub fn new(identifier: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            endpoint: endpoint.into(),
        }
    }

    /// The deterministic document id this key is stored under.
    ///
    /// Both parts are escaped so the id only contains `[A-Za-z0-9_.-]`, which
    /// is safe for document stores that reserve `/` and similar separators.
    /// `-` is the escape character: `-`, `_` and any other byte outside
    /// `[A-Za-z0-9.]` become `-XX` (uppercase hex). The single unescaped `_`
    /// separates identifier from endpoint, so distinct pairs never share an id.
    pub fn document_id(&self) -> String {
        let mut id = String::with_capacity(self.identifier.len() + self.endpoint.len() + 1);
        escape_into(&mut id, &self.identifier);
        id.push('_');
        escape_into(&mut id, &self.endpoint);
        id
    }
}

fn escape_into(out: &mut String, part: &str) {
    for byte in part.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'.' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("-{:02X}", byte));
        }
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.identifier)
    }
}

/// The stored counter for one (identifier, endpoint) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowRecord {
    pub identifier: String,
    pub endpoint: String,
    /// When the current window began (ms since epoch)
    #[serde(rename = "windowStart")]
    pub window_start_ms: u64,
    /// Requests admitted in the current window
    pub count: u64,
    /// Most recent admitted or rejected request; diagnostic only
    #[serde(rename = "lastRequestAt")]
    pub last_request_at_ms: u64,
}

impl WindowRecord {
    /// A record for a window that starts at `now_ms` with one admitted request.
    pub fn fresh(key: &WindowKey, now_ms: u64) -> Self {
        Self {
            identifier: key.identifier.clone(),
            endpoint: key.endpoint.clone(),
            window_start_ms: now_ms,
            count: 1,
            last_request_at_ms: now_ms,
        }
    }

    /// Whether the window has fully elapsed at `now_ms`.
    pub fn is_expired(&self, now_ms: u64, window_duration_ms: u64) -> bool {
        now_ms.saturating_sub(self.window_start_ms) >= window_duration_ms
    }

    /// When the current window ends (ms since epoch).
    pub fn reset_at_ms(&self, window_duration_ms: u64) -> u64 {
        self.window_start_ms.saturating_add(window_duration_ms)
    }
}
