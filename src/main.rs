//! Telemetry Spool - demo host for the telemetry engine
//!
//! Registers this machine as a device, records a heartbeat event at a fixed
//! cadence and lets the engine batch them to the collector.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `TELEMETRY_ANALYTICS_URL`: Analytics collector base URL (default: http://localhost:8000)
//! - `TELEMETRY_REGISTRATION_URL`: Registration service base URL (default: analytics URL)
//! - `TELEMETRY_SEND_INTERVAL_SECS`: Seconds between dispatches (default: 120)
//! - `TELEMETRY_BATCH_THRESHOLD`: Buffered events that trigger a dispatch (default: 10)
//! - `TELEMETRY_CACHE_DIR`: Directory for the identity and unsent records (default: telemetry-cache)
//! - `TELEMETRY_COUNTRY_URL`: Geo-IP lookup for the country property (default: http://ip-api.com/json/)
//! - `TELEMETRY_DEVICE_ID`: Fixed device id (default: generated once and cached)
//! - `TELEMETRY_ADVERTISING_ID`: Optional advertising id sent at registration
//! - `TELEMETRY_HEARTBEAT_SECS`: Seconds between heartbeat events (default: 5)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::env;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_spool::config::Config;
use telemetry_spool::identity::{FileIdentityStore, Identity};
use telemetry_spool::telemetry::Telemetry;

/// Default seconds between heartbeat events
const DEFAULT_HEARTBEAT_SECS: u64 = 5;

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting telemetry demo host...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                analytics_url = %config.analytics_url,
                registration_url = %config.registration_url,
                send_interval_secs = config.send_interval.as_secs(),
                batch_threshold = config.batch_threshold,
                cache_dir = %config.cache_dir.display(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let device_id = match device_id(&config) {
        Ok(device_id) => device_id,
        Err(e) => {
            error!(error = %e, "Failed to resolve device id");
            std::process::exit(1);
        }
    };
    let identity = Identity::new(
        config.platform.clone(),
        device_id,
        env::var("TELEMETRY_ADVERTISING_ID").ok(),
    );

    let telemetry = match Telemetry::from_config(config) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            error!(error = %e, "Failed to create telemetry engine");
            std::process::exit(1);
        }
    };
    telemetry.init(identity);

    let heartbeat = heartbeat_interval();
    let cancel = CancellationToken::new();
    let producer_handle = {
        let telemetry = telemetry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            info!(interval_secs = heartbeat.as_secs(), "Heartbeat producer started");
            run_heartbeat(telemetry, heartbeat, cancel).await;
            info!("Heartbeat producer stopped");
        })
    };

    info!("Telemetry demo running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    cancel.cancel();
    if let Err(e) = producer_handle.await {
        warn!(error = %e, "Heartbeat producer panicked");
    }

    let stats = telemetry.stats();
    info!(
        user_id = stats.user_id,
        records_delivered = stats.scheduler.records_delivered,
        pending_events = stats.pending.events,
        "Final statistics"
    );

    if let Err(e) = telemetry.shutdown().await {
        warn!(error = %e, "Unsent records could not be cached");
    }

    info!("Telemetry demo stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

fn device_id(config: &Config) -> Result<String, telemetry_spool::PersistenceError> {
    match env::var("TELEMETRY_DEVICE_ID") {
        Ok(id) if !id.trim().is_empty() => Ok(id.trim().to_string()),
        _ => FileIdentityStore::new(&config.cache_dir).load_or_create_device_id(),
    }
}

fn heartbeat_interval() -> Duration {
    let secs = env::var("TELEMETRY_HEARTBEAT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&secs| secs > 0)
        .unwrap_or(DEFAULT_HEARTBEAT_SECS);
    Duration::from_secs(secs)
}

/// Record a heartbeat event and session activity on every tick until cancelled.
async fn run_heartbeat(telemetry: Telemetry, period: Duration, cancel: CancellationToken) {
    let started = Instant::now();
    let mut ticker = interval(period);
    let mut beats: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        beats += 1;
        let uptime = started.elapsed().as_secs() as i64;
        telemetry.record_event("heartbeat", &[("uptime_secs", uptime.into())]);
        telemetry.register_activity();

        if beats % 60 == 0 {
            let stats = telemetry.stats();
            info!(
                beats = beats,
                pending_events = stats.pending.events,
                records_delivered = stats.scheduler.records_delivered,
                "Heartbeat progress"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_heartbeat_interval() {
        assert!(DEFAULT_HEARTBEAT_SECS > 0);
        assert!(DEFAULT_HEARTBEAT_SECS <= 60);
    }

    #[test]
    fn test_device_id_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cache_dir: dir.path().to_path_buf(),
            ..Config::default()
        };

        // Only meaningful when the override is not set in the test environment.
        if env::var("TELEMETRY_DEVICE_ID").is_err() {
            let first = device_id(&config).unwrap();
            let second = device_id(&config).unwrap();
            assert_eq!(first, second);
            assert_eq!(first.len(), 32);
        }
    }
}
