//! Configuration loading from environment variables.
//!
//! All values are loaded from `FD_EXCHANGE_*` environment variables with
//! sensible defaults. Invalid values fall back to defaults without
//! crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `FD_EXCHANGE_POLL_INTERVAL_MS` | 500 | Dispatch loop idle/readiness wait (ms) |
//! | `FD_EXCHANGE_MAX_FRAME` | 65536 | Max encoded frame size (bytes) |
//! | `FD_EXCHANGE_CLOEXEC` | none | Close-on-exec policy (none/client/server/both) |

use std::time::Duration;

use crate::exchange::{CloexecPolicy, ExchangeServerConfig, MIN_FRAME_SIZE};

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_MAX_FRAME: usize = 64 * 1024;
const MAX_POLL_INTERVAL_MS: u64 = 60_000;

/// Effective configuration summary.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub poll_interval_ms: u64,
    pub max_frame_size: usize,
    pub cloexec: CloexecPolicy,
}

/// All configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub exchange: ExchangeServerConfig,
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_cloexec(key: &str) -> CloexecPolicy {
    match std::env::var(key) {
        Ok(val) => val.parse::<CloexecPolicy>().unwrap_or_default(),
        Err(_) => CloexecPolicy::default(),
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without
/// panicking.
pub fn load() -> EnvConfig {
    let interval_ms = parse_u64("FD_EXCHANGE_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS);
    let interval_ms = interval_ms.clamp(1, MAX_POLL_INTERVAL_MS);

    let max_frame = parse_usize("FD_EXCHANGE_MAX_FRAME", DEFAULT_MAX_FRAME);
    let max_frame = max_frame.max(MIN_FRAME_SIZE);

    let cloexec = parse_cloexec("FD_EXCHANGE_CLOEXEC");

    EnvConfig {
        exchange: ExchangeServerConfig {
            poll_interval: Duration::from_millis(interval_ms),
            max_frame_size: max_frame,
            cloexec,
        },
    }
}

impl EnvConfig {
    /// Return a summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            poll_interval_ms: self.exchange.poll_interval.as_millis() as u64,
            max_frame_size: self.exchange.max_frame_size,
            cloexec: self.exchange.cloexec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "FD_EXCHANGE_POLL_INTERVAL_MS",
        "FD_EXCHANGE_MAX_FRAME",
        "FD_EXCHANGE_CLOEXEC",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.exchange.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.exchange.max_frame_size, 64 * 1024);
        assert_eq!(cfg.exchange.cloexec, CloexecPolicy::None);
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("FD_EXCHANGE_POLL_INTERVAL_MS", "100");
        std::env::set_var("FD_EXCHANGE_MAX_FRAME", "131072");
        std::env::set_var("FD_EXCHANGE_CLOEXEC", "both");
        let cfg = load();
        assert_eq!(cfg.exchange.poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.exchange.max_frame_size, 131_072);
        assert_eq!(cfg.exchange.cloexec, CloexecPolicy::Both);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("FD_EXCHANGE_POLL_INTERVAL_MS", "not_a_number");
        std::env::set_var("FD_EXCHANGE_CLOEXEC", "everything");
        let cfg = load();
        assert_eq!(cfg.exchange.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.exchange.cloexec, CloexecPolicy::None);
        clear_env_vars();
    }

    #[test]
    fn test_poll_interval_is_clamped() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("FD_EXCHANGE_POLL_INTERVAL_MS", "0");
        let cfg = load();
        assert!(cfg.exchange.poll_interval >= Duration::from_millis(1));

        std::env::set_var("FD_EXCHANGE_POLL_INTERVAL_MS", "999999999");
        let cfg = load();
        assert!(cfg.exchange.poll_interval <= Duration::from_millis(60_000));
        clear_env_vars();
    }

    #[test]
    fn test_max_frame_floor() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("FD_EXCHANGE_MAX_FRAME", "1");
        let cfg = load();
        assert!(cfg.exchange.max_frame_size >= MIN_FRAME_SIZE);
        clear_env_vars();
    }

    #[test]
    fn test_effective_config_reflects_values() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let eff = load().effective_config();
        assert_eq!(eff.poll_interval_ms, 500);
        assert!(eff.max_frame_size >= MIN_FRAME_SIZE);
        clear_env_vars();
    }
}
