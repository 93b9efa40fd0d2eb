use std::time::Duration;

/// Default assistant service base URL for local development.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/chat";

/// Default per-character reveal delay for the typing effect.
///
/// A pacing tunable, not a correctness requirement; zero disables pacing.
pub const DEFAULT_REVEAL_INTERVAL: Duration = Duration::from_millis(15);

/// Default bound on silence between stream reads before giving up.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-wide configuration threaded through the backend and session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub reveal_interval: Duration,
    pub idle_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            reveal_interval: DEFAULT_REVEAL_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_reveal_interval(mut self, reveal_interval: Duration) -> Self {
        self.reveal_interval = reveal_interval;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}
