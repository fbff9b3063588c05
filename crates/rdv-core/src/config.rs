//! Explicit configuration passed to the session executor.
//!
//! Nothing here reads the process environment: binaries fill these structs
//! from their command line (with `env` fallbacks handled by clap).

use std::time::Duration;

/// Limits and session settings for statement execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Statement timeout used when the caller does not request one.
    pub default_timeout_ms: u64,
    /// Hard cap on any requested statement timeout.
    pub max_timeout_ms: u64,
    /// Rows kept per result; the rest are dropped and `truncated` is set.
    pub max_rows: usize,
    /// Maximum open connections per pool.
    pub pool_size: usize,
    /// How long to wait for a free pooled connection.
    pub acquire_timeout_ms: u64,
    /// TCP/TLS connect timeout for new connections.
    pub connect_timeout_ms: u64,
    /// Schemas installed with `SET LOCAL search_path`.
    pub search_path: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            max_timeout_ms: 10_000,
            max_rows: 1_000,
            pool_size: 4,
            acquire_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            search_path: vec!["pg_catalog".to_string(), "$user".to_string()],
        }
    }
}

impl SessionConfig {
    /// Clamps a requested timeout to `[1, max_timeout_ms]`.
    ///
    /// A misconfigured default above the cap is also clamped.
    pub fn resolve_timeout_ms(&self, requested: Option<u64>) -> u64 {
        let cap = self.max_timeout_ms.max(1);
        requested.unwrap_or(self.default_timeout_ms).clamp(1, cap)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_defaults_and_clamps() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.resolve_timeout_ms(None), 5_000);
        assert_eq!(cfg.resolve_timeout_ms(Some(0)), 1);
        assert_eq!(cfg.resolve_timeout_ms(Some(60_000)), 10_000);
        assert_eq!(cfg.resolve_timeout_ms(Some(250)), 250);
    }

    #[test]
    fn default_above_cap_is_clamped() {
        let cfg = SessionConfig {
            default_timeout_ms: 30_000,
            max_timeout_ms: 2_000,
            ..Default::default()
        };
        assert_eq!(cfg.resolve_timeout_ms(None), 2_000);
    }
}
