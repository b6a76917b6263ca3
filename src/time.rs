//! Server time reconciliation.
//!
//! Records are stamped with the local wall clock, which may be arbitrarily
//! wrong. Once a network time estimate exists, every record is shifted onto
//! the server's timeline exactly once before it is sent:
//! `server_anchor + (ts - local_anchor)`.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DeliveryError;
use crate::model::Timestamped;
use crate::transport::Transport;

/// Wait between failed network time fetches.
pub const DEFAULT_TIME_RETRY_INTERVAL: Duration = Duration::from_secs(120);

/// An estimate younger than this is extrapolated instead of refetched.
pub const ESTIMATE_FRESHNESS: Duration = Duration::from_secs(1);

/// A pair of matching instants on the local and the server clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeEstimate {
    pub local_anchor: DateTime<Utc>,
    pub server_anchor: DateTime<Utc>,
}

impl TimeEstimate {
    /// Map a local instant onto the server timeline.
    pub fn to_server(&self, local: DateTime<Utc>) -> DateTime<Utc> {
        self.server_anchor + (local - self.local_anchor)
    }

    /// Offset of the server clock relative to the local one.
    pub fn offset(&self) -> chrono::Duration {
        self.server_anchor - self.local_anchor
    }

    /// Reconcile every timestamp of `record` unless that already happened.
    ///
    /// Returns true if the record was rewritten.
    pub fn apply<R: Timestamped + ?Sized>(&self, record: &mut R) -> bool {
        if record.is_validated() {
            return false;
        }
        record.for_each_timestamp_mut(&mut |ts| *ts = self.to_server(*ts));
        record.mark_validated();
        true
    }
}

/// Owns the process-wide time estimate.
pub struct TimeReconciler {
    transport: Arc<dyn Transport>,
    retry_interval: Duration,
    estimate: RwLock<Option<TimeEstimate>>,
}

impl TimeReconciler {
    pub fn new(transport: Arc<dyn Transport>, retry_interval: Duration) -> Self {
        Self {
            transport,
            retry_interval,
            estimate: RwLock::new(None),
        }
    }

    /// The current estimate, absent until the first successful fetch.
    pub fn current(&self) -> Option<TimeEstimate> {
        *self.estimate.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_estimate(&self) -> bool {
        self.current().is_some()
    }

    /// Estimate server time at `local_now`.
    ///
    /// Reuses the last estimate if it was taken less than a second earlier,
    /// otherwise fetches network time and backs out the request latency.
    ///
    /// # Errors
    ///
    /// Returns the transport's error when a fetch was needed and failed. The
    /// previous estimate, if any, is kept.
    pub async fn estimate(&self, local_now: DateTime<Utc>) -> Result<DateTime<Utc>, DeliveryError> {
        if let Some(previous) = self.current() {
            let age = local_now - previous.local_anchor;
            if age >= chrono::Duration::zero()
                && age.to_std().map_or(false, |age| age < ESTIMATE_FRESHNESS)
            {
                return Ok(previous.to_server(local_now));
            }
        }

        let started = Instant::now();
        let fetched = self.transport.network_time().await?;
        let elapsed = chrono::Duration::from_std(started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());

        let estimate = TimeEstimate {
            local_anchor: local_now,
            server_anchor: fetched - elapsed,
        };
        *self.estimate.write().unwrap_or_else(PoisonError::into_inner) = Some(estimate);

        debug!(
            offset_ms = estimate.offset().num_milliseconds(),
            latency_ms = elapsed.num_milliseconds(),
            "Network time estimate updated"
        );
        Ok(estimate.server_anchor)
    }

    /// Fetch network time until it succeeds or `cancel` fires.
    ///
    /// Returns the established estimate, or `None` when cancelled first.
    pub async fn run(&self, cancel: &CancellationToken) -> Option<TimeEstimate> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                result = self.estimate(Utc::now()) => result,
            };

            match result {
                Ok(_) => {
                    let estimate = self.current();
                    if let Some(estimate) = &estimate {
                        info!(
                            attempt = attempt,
                            offset_ms = estimate.offset().num_milliseconds(),
                            "Server time established"
                        );
                    }
                    return estimate;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        attempt = attempt,
                        retry_secs = self.retry_interval.as_secs(),
                        "Network time fetch failed, will retry"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// Reconcile one record; a no-op without an estimate or when already done.
    pub fn reconcile<R: Timestamped + ?Sized>(&self, record: &mut R) -> bool {
        match self.current() {
            Some(estimate) => estimate.apply(record),
            None => false,
        }
    }

    pub fn to_server_time(&self, local: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.current().map(|estimate| estimate.to_server(local))
    }

    /// Best known server time right now; the local clock until an estimate exists.
    pub fn server_now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        self.to_server_time(now).unwrap_or(now)
    }
}
