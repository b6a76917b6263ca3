//! Configuration module for the telemetry engine.
//!
//! This module provides environment-based configuration: collector base URLs,
//! dispatch cadence, pool sizing, retry intervals and the application profile
//! stamped into outgoing payloads.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::RecordKind;
use crate::pool::{DEFAULT_CAPACITY_CEILING, DEFAULT_INITIAL_CAPACITY};

/// Default base URL for both the analytics and registration services
const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Default seconds between scheduled dispatches
const DEFAULT_SEND_INTERVAL_SECS: u64 = 120;

/// Default number of buffered events that triggers an early dispatch
const DEFAULT_BATCH_THRESHOLD: u64 = 10;

/// Default seconds between network time fetch attempts
const DEFAULT_TIME_RETRY_SECS: u64 = 120;

/// Default seconds between registration attempts
const DEFAULT_REGISTRATION_RETRY_SECS: u64 = 15;

/// Default HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default retry attempts for a single batch send
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default directory for cached pools and identity
const DEFAULT_CACHE_DIR: &str = "telemetry-cache";

/// Default geo-IP lookup answering `{"country": ..}`
const DEFAULT_COUNTRY_URL: &str = "http://ip-api.com/json/";

/// Default A/B mode label
const DEFAULT_AB_MODE: &str = "default";

/// Minimum dispatch interval to prevent overwhelming the collector
const MIN_SEND_INTERVAL_SECS: u64 = 1;

/// Maximum dispatch interval to ensure reasonable data freshness
const MAX_SEND_INTERVAL_SECS: u64 = 3600;

/// Maximum batch threshold; larger values defeat the early-dispatch trigger
const MAX_BATCH_THRESHOLD: u64 = 10_000;

/// Absolute upper bound on pool size to prevent memory issues
const MAX_POOL_CEILING: u64 = 1_000_000;

/// Collector endpoints, one per record kind plus the registration services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub events: String,
    pub properties: String,
    pub sessions: String,
    pub network_time: String,
    pub registration: String,
    /// Prefix of the tester lookup; the user id is appended as a path segment
    pub tester: String,
    /// Geo-IP lookup used for the `country` user property
    pub country: String,
}

impl Endpoints {
    /// Build every endpoint from the analytics and registration base URLs.
    pub fn from_bases(analytics: &str, registration: &str) -> Self {
        let analytics = analytics.trim_end_matches('/');
        let registration = registration.trim_end_matches('/');

        Self {
            events: format!("{}/AnalyticsData/SendEvents", analytics),
            properties: format!("{}/AnalyticsData/SendProperties", analytics),
            sessions: format!("{}/Sessions/SaveSession", registration),
            network_time: format!("{}/Registration/GetNetworkTime", registration),
            registration: format!("{}/Registration/GetOrCreateUserId", registration),
            tester: format!("{}/Registration/GetTester", registration),
            country: DEFAULT_COUNTRY_URL.to_string(),
        }
    }

    /// Endpoint that accepts batches of `kind`.
    pub fn for_kind(&self, kind: RecordKind) -> &str {
        match kind {
            RecordKind::Event => &self.events,
            RecordKind::Property => &self.properties,
            RecordKind::Session => &self.sessions,
        }
    }
}

/// Configuration for the telemetry engine.
///
/// All settings can be configured via environment variables:
/// - `TELEMETRY_ANALYTICS_URL` / `TELEMETRY_REGISTRATION_URL`: service base URLs
/// - `TELEMETRY_SEND_INTERVAL_SECS`: seconds between dispatches (default: 120)
/// - `TELEMETRY_BATCH_THRESHOLD`: buffered events that force a dispatch (default: 10)
/// - `TELEMETRY_POOL_CAPACITY` / `TELEMETRY_POOL_CEILING`: pool sizing (default: 500 / 10000)
/// - `TELEMETRY_TIME_RETRY_SECS`: network time retry interval (default: 120)
/// - `TELEMETRY_REGISTRATION_RETRY_SECS`: registration retry interval (default: 15)
/// - `TELEMETRY_REQUEST_TIMEOUT_SECS`, `TELEMETRY_MAX_RETRIES`: HTTP behaviour
/// - `TELEMETRY_COUNTRY_URL`: geo-IP lookup for the country property
/// - `TELEMETRY_CACHE_DIR`, `TELEMETRY_APP_VERSION`, `TELEMETRY_AB_MODE`, `TELEMETRY_PLATFORM`
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the analytics service (events, properties)
    pub analytics_url: String,

    /// Base URL of the registration service (identity, sessions, time)
    pub registration_url: String,

    /// Full endpoint URLs derived from the base URLs
    pub endpoints: Endpoints,

    /// Interval between scheduled dispatches
    pub send_interval: Duration,

    /// Number of buffered events that triggers an immediate dispatch
    pub batch_threshold: usize,

    /// Initial number of slots per record pool
    pub pool_capacity: usize,

    /// Size a pool may grow to before it drops its oldest records
    pub pool_ceiling: usize,

    /// Wait between failed network time fetches
    pub time_retry_interval: Duration,

    /// Wait between unsuccessful registration attempts
    pub registration_retry_interval: Duration,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Maximum number of retry attempts for a failed batch send
    pub max_retries: u32,

    /// Directory holding cached pools and the persisted identity
    pub cache_dir: PathBuf,

    /// Application version stamped into events and registration
    pub app_version: String,

    /// A/B mode label attached to sessions
    pub ab_mode: String,

    /// Platform name reported at registration
    pub platform: String,
}

/// Error type for configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable holds an unusable value
    #[error("Configuration error for {env_var}: {message}")]
    Invalid { env_var: String, message: String },

    /// Individually valid settings that conflict with each other
    #[error("Configuration error: {0}")]
    Inconsistent(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Returns a new `Config` instance with values from environment variables,
    /// falling back to sensible defaults where appropriate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a numeric variable does not parse, falls outside
    /// its allowed range, or if the pool ceiling is smaller than its capacity.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_spool::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Events endpoint: {}", config.endpoints.events);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let analytics_url = env::var("TELEMETRY_ANALYTICS_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let registration_url = env::var("TELEMETRY_REGISTRATION_URL")
            .unwrap_or_else(|_| analytics_url.clone())
            .trim_end_matches('/')
            .to_string();

        let mut endpoints = Endpoints::from_bases(&analytics_url, &registration_url);
        if let Ok(country) = env::var("TELEMETRY_COUNTRY_URL") {
            endpoints.country = country;
        }

        let send_interval = Duration::from_secs(parse_bounded(
            "TELEMETRY_SEND_INTERVAL_SECS",
            DEFAULT_SEND_INTERVAL_SECS,
            MIN_SEND_INTERVAL_SECS,
            MAX_SEND_INTERVAL_SECS,
        )?);

        let batch_threshold = parse_bounded(
            "TELEMETRY_BATCH_THRESHOLD",
            DEFAULT_BATCH_THRESHOLD,
            1,
            MAX_BATCH_THRESHOLD,
        )? as usize;

        let pool_capacity = parse_bounded(
            "TELEMETRY_POOL_CAPACITY",
            DEFAULT_INITIAL_CAPACITY as u64,
            1,
            MAX_POOL_CEILING,
        )? as usize;

        let pool_ceiling = parse_bounded(
            "TELEMETRY_POOL_CEILING",
            DEFAULT_CAPACITY_CEILING as u64,
            1,
            MAX_POOL_CEILING,
        )? as usize;

        if pool_ceiling < pool_capacity {
            return Err(ConfigError::Inconsistent(format!(
                "pool ceiling {} is smaller than pool capacity {}",
                pool_ceiling, pool_capacity
            )));
        }

        let time_retry_interval = Duration::from_secs(parse_bounded(
            "TELEMETRY_TIME_RETRY_SECS",
            DEFAULT_TIME_RETRY_SECS,
            1,
            MAX_SEND_INTERVAL_SECS,
        )?);

        let registration_retry_interval = Duration::from_secs(parse_bounded(
            "TELEMETRY_REGISTRATION_RETRY_SECS",
            DEFAULT_REGISTRATION_RETRY_SECS,
            1,
            MAX_SEND_INTERVAL_SECS,
        )?);

        // Optional knobs fall back silently, like the HTTP settings always have.
        let request_timeout_secs: u64 = env::var("TELEMETRY_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        let max_retries: u32 = env::var("TELEMETRY_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let cache_dir = env::var("TELEMETRY_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CACHE_DIR));

        let app_version = env::var("TELEMETRY_APP_VERSION")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

        let ab_mode =
            env::var("TELEMETRY_AB_MODE").unwrap_or_else(|_| DEFAULT_AB_MODE.to_string());

        let platform =
            env::var("TELEMETRY_PLATFORM").unwrap_or_else(|_| env::consts::OS.to_string());

        Ok(Self {
            analytics_url,
            registration_url,
            endpoints,
            send_interval,
            batch_threshold,
            pool_capacity,
            pool_ceiling,
            time_retry_interval,
            registration_retry_interval,
            request_timeout: Duration::from_secs(request_timeout_secs),
            max_retries,
            cache_dir,
            app_version,
            ab_mode,
            platform,
        })
    }
}

/// Parse an integer environment variable and check it against `[min, max]`.
fn parse_bounded(env_var: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
    let value = match env::var(env_var) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };

    let parsed: u64 = value.trim().parse().map_err(|_| ConfigError::Invalid {
        env_var: env_var.to_string(),
        message: format!("'{}' is not a valid number", value),
    })?;

    if parsed < min {
        return Err(ConfigError::Invalid {
            env_var: env_var.to_string(),
            message: format!("value {} is below minimum ({})", parsed, min),
        });
    }

    if parsed > max {
        return Err(ConfigError::Invalid {
            env_var: env_var.to_string(),
            message: format!("value {} exceeds maximum allowed ({})", parsed, max),
        });
    }

    Ok(parsed)
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            analytics_url: DEFAULT_BASE_URL.to_string(),
            registration_url: DEFAULT_BASE_URL.to_string(),
            endpoints: Endpoints::from_bases(DEFAULT_BASE_URL, DEFAULT_BASE_URL),
            send_interval: Duration::from_secs(DEFAULT_SEND_INTERVAL_SECS),
            batch_threshold: DEFAULT_BATCH_THRESHOLD as usize,
            pool_capacity: DEFAULT_INITIAL_CAPACITY,
            pool_ceiling: DEFAULT_CAPACITY_CEILING,
            time_retry_interval: Duration::from_secs(DEFAULT_TIME_RETRY_SECS),
            registration_retry_interval: Duration::from_secs(DEFAULT_REGISTRATION_RETRY_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            ab_mode: DEFAULT_AB_MODE.to_string(),
            platform: env::consts::OS.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, MutexGuard};

    // Environment is process-global; serialize the tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    const ALL_VARS: &[&str] = &[
        "TELEMETRY_ANALYTICS_URL",
        "TELEMETRY_REGISTRATION_URL",
        "TELEMETRY_SEND_INTERVAL_SECS",
        "TELEMETRY_BATCH_THRESHOLD",
        "TELEMETRY_POOL_CAPACITY",
        "TELEMETRY_POOL_CEILING",
        "TELEMETRY_TIME_RETRY_SECS",
        "TELEMETRY_REGISTRATION_RETRY_SECS",
        "TELEMETRY_COUNTRY_URL",
    ];

    fn clear_all() -> Vec<EnvGuard> {
        ALL_VARS.iter().map(|v| EnvGuard::remove(v)).collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.analytics_url, "http://localhost:8000");
        assert_eq!(config.send_interval, Duration::from_secs(120));
        assert_eq!(config.batch_threshold, 10);
        assert_eq!(config.pool_capacity, 500);
        assert_eq!(config.pool_ceiling, 10_000);
        assert_eq!(config.time_retry_interval, Duration::from_secs(120));
        assert_eq!(config.registration_retry_interval, Duration::from_secs(15));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = env_lock();
        let _guards = clear_all();

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.analytics_url, "http://localhost:8000");
        assert_eq!(config.registration_url, "http://localhost:8000");
        assert_eq!(config.batch_threshold, 10);
        assert_eq!(config.send_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = env_lock();
        let _guards = clear_all();
        let _g1 = EnvGuard::set("TELEMETRY_ANALYTICS_URL", "https://analytics.example.com/");
        let _g2 = EnvGuard::set("TELEMETRY_REGISTRATION_URL", "https://reg.example.com");
        let _g3 = EnvGuard::set("TELEMETRY_SEND_INTERVAL_SECS", "30");
        let _g4 = EnvGuard::set("TELEMETRY_BATCH_THRESHOLD", "25");
        let _g5 = EnvGuard::set("TELEMETRY_POOL_CAPACITY", "64");
        let _g6 = EnvGuard::set("TELEMETRY_POOL_CEILING", "256");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.analytics_url, "https://analytics.example.com"); // Trailing slash removed
        assert_eq!(
            config.endpoints.events,
            "https://analytics.example.com/AnalyticsData/SendEvents"
        );
        assert_eq!(
            config.endpoints.registration,
            "https://reg.example.com/Registration/GetOrCreateUserId"
        );
        assert_eq!(config.send_interval, Duration::from_secs(30));
        assert_eq!(config.batch_threshold, 25);
        assert_eq!(config.pool_capacity, 64);
        assert_eq!(config.pool_ceiling, 256);
    }

    #[test]
    fn test_registration_url_defaults_to_analytics_url() {
        let _lock = env_lock();
        let _guards = clear_all();
        let _g = EnvGuard::set("TELEMETRY_ANALYTICS_URL", "http://collector:9000");

        let config = Config::from_env().unwrap();
        assert_eq!(config.registration_url, "http://collector:9000");
        assert_eq!(
            config.endpoints.sessions,
            "http://collector:9000/Sessions/SaveSession"
        );
    }

    #[test]
    fn test_invalid_batch_threshold() {
        let _lock = env_lock();
        let _guards = clear_all();
        let _g = EnvGuard::set("TELEMETRY_BATCH_THRESHOLD", "not_a_number");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("not a valid number"));
        assert!(err.to_string().contains("TELEMETRY_BATCH_THRESHOLD"));
    }

    #[test]
    fn test_zero_batch_threshold() {
        let _lock = env_lock();
        let _guards = clear_all();
        let _g = EnvGuard::set("TELEMETRY_BATCH_THRESHOLD", "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("below minimum"));
    }

    #[test]
    fn test_send_interval_exceeds_max() {
        let _lock = env_lock();
        let _guards = clear_all();
        let _g = EnvGuard::set("TELEMETRY_SEND_INTERVAL_SECS", "99999");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_ceiling_below_capacity_rejected() {
        let _lock = env_lock();
        let _guards = clear_all();
        let _g1 = EnvGuard::set("TELEMETRY_POOL_CAPACITY", "1000");
        let _g2 = EnvGuard::set("TELEMETRY_POOL_CEILING", "100");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn test_endpoints_for_kind() {
        let endpoints = Endpoints::from_bases("http://a/", "http://r");
        assert_eq!(endpoints.for_kind(RecordKind::Event), "http://a/AnalyticsData/SendEvents");
        assert_eq!(
            endpoints.for_kind(RecordKind::Property),
            "http://a/AnalyticsData/SendProperties"
        );
        assert_eq!(endpoints.for_kind(RecordKind::Session), "http://r/Sessions/SaveSession");
        assert_eq!(endpoints.network_time, "http://r/Registration/GetNetworkTime");
        assert_eq!(endpoints.tester, "http://r/Registration/GetTester");
        assert_eq!(endpoints.country, DEFAULT_COUNTRY_URL);
    }

    #[test]
    fn test_country_url_override() {
        let _lock = env_lock();
        let _guards = clear_all();
        let _g = EnvGuard::set("TELEMETRY_COUNTRY_URL", "http://geo.local/json");

        let config = Config::from_env().unwrap();
        assert_eq!(config.endpoints.country, "http://geo.local/json");
        assert_eq!(config.endpoints.tester, "http://localhost:8000/Registration/GetTester");
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::Invalid {
            env_var: "TEST_VAR".to_string(),
            message: "test error".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error = ConfigError::Inconsistent("general error".to_string());
        assert_eq!(format!("{}", error), "Configuration error: general error");
    }
}
