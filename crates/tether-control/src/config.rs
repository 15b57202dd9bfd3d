use std::{path::PathBuf, time::Duration};

const DEFAULT_DATABASE_URL: &str = "sqlite://tether.db?mode=rwc";
const DEFAULT_TIMEOUT_TIMER_MS: u64 = 30_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5 * 60 * 1000;
const DEFAULT_START_WORKER_TIMEOUT_MS: u64 = 5 * 60 * 1000;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 30_000;

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env_string(name).map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn clamped_millis(raw: Option<u64>, default_ms: u64, min_ms: u64, max_ms: u64) -> Duration {
    Duration::from_millis(raw.map(|v| v.clamp(min_ms, max_ms)).unwrap_or(default_ms))
}

fn env_millis(name: &str, default_ms: u64, min_ms: u64, max_ms: u64) -> Duration {
    clamped_millis(env_u64(name), default_ms, min_ms, max_ms)
}

/// Runtime knobs of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub database_url: String,
    /// How often request deadlines, start deadlines, pings and idleness are checked.
    pub timeout_timer_interval: Duration,
    pub request_timeout: Duration,
    pub start_worker_timeout: Duration,
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub purge_on_startup: bool,
    /// Directory of the local body store used by the admin binary.
    pub body_root: PathBuf,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            timeout_timer_interval: Duration::from_millis(DEFAULT_TIMEOUT_TIMER_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            start_worker_timeout: Duration::from_millis(DEFAULT_START_WORKER_TIMEOUT_MS),
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
            purge_on_startup: true,
            body_root: PathBuf::from("tether-bodies"),
        }
    }
}

impl CoordinatorConfig {
    /// Reads `TETHER_*` variables, clamping each to a sane range.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_string("TETHER_DATABASE_URL").unwrap_or(defaults.database_url),
            timeout_timer_interval: env_millis(
                "TETHER_TIMEOUT_TIMER_MS",
                DEFAULT_TIMEOUT_TIMER_MS,
                10,
                10 * 60 * 1000,
            ),
            request_timeout: env_millis(
                "TETHER_REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
                100,
                60 * 60 * 1000,
            ),
            start_worker_timeout: env_millis(
                "TETHER_START_WORKER_TIMEOUT_MS",
                DEFAULT_START_WORKER_TIMEOUT_MS,
                100,
                60 * 60 * 1000,
            ),
            idle_timeout: env_millis(
                "TETHER_IDLE_TIMEOUT_MS",
                DEFAULT_IDLE_TIMEOUT_MS,
                100,
                60 * 60 * 1000,
            ),
            ping_interval: env_millis(
                "TETHER_PING_INTERVAL_MS",
                DEFAULT_PING_INTERVAL_MS,
                100,
                60 * 60 * 1000,
            ),
            ping_timeout: env_millis(
                "TETHER_PING_TIMEOUT_MS",
                DEFAULT_PING_TIMEOUT_MS,
                100,
                60 * 60 * 1000,
            ),
            purge_on_startup: env_bool("TETHER_PURGE_ON_STARTUP")
                .unwrap_or(defaults.purge_on_startup),
            body_root: env_string("TETHER_BODY_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.body_root),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timeouts() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.timeout_timer_interval, Duration::from_secs(30));
        assert_eq!(cfg.request_timeout, Duration::from_secs(300));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(30));
        assert!(cfg.purge_on_startup);
    }

    #[test]
    fn out_of_range_millis_are_clamped() {
        assert_eq!(clamped_millis(Some(1), 1234, 10, 5000), Duration::from_millis(10));
        assert_eq!(clamped_millis(Some(90_000), 1234, 10, 5000), Duration::from_millis(5000));
        assert_eq!(clamped_millis(Some(700), 1234, 10, 5000), Duration::from_millis(700));
    }

    #[test]
    fn unset_variable_falls_back_to_default() {
        let d = env_millis("TETHER_TEST_UNSET_VARIABLE_XYZ", 1234, 10, 5000);
        assert_eq!(d, Duration::from_millis(1234));
    }
}
