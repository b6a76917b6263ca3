//! Dispatch scheduling for buffered records.
//!
//! The scheduler drains the three record pools on a fixed interval, or early
//! once enough events are buffered. Each dispatch runs the per-kind sends
//! concurrently and settles every kind on its own: a failed kind keeps its
//! records for the next cycle, a successful one compacts exactly the records
//! that were sent.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::DeliveryError;
use crate::identity::IdentityRegistrar;
use crate::model::{
    encode_batch, Event, Property, RecordKind, Timestamped, WireContext, WireRecord,
};
use crate::pool::{PoolRecord, RecordPool};
use crate::session::SessionBook;
use crate::time::{TimeEstimate, TimeReconciler};
use crate::transport::{Batch, DeliveryReport, Transport};

/// Default time between scheduled dispatches.
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(120);

/// Default number of buffered events that triggers an early dispatch.
pub const DEFAULT_BATCH_THRESHOLD: usize = 10;

/// Configuration for the dispatch scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Duration between dispatches when the threshold is not reached
    pub send_interval: Duration,

    /// Number of buffered events that forces a dispatch
    pub batch_threshold: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            send_interval: DEFAULT_SEND_INTERVAL,
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
        }
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            send_interval: config.send_interval,
            batch_threshold: config.batch_threshold,
        }
    }
}

/// Number of busy records per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub events: usize,
    pub properties: usize,
    pub sessions: usize,
}

/// The three record pools, shared between producers and the scheduler.
///
/// Locks are only ever held for in-memory work, never across an await.
pub struct RecordBuffers {
    events: Mutex<RecordPool<Event>>,
    properties: Mutex<RecordPool<Property>>,
    sessions: Mutex<SessionBook>,
    batch_threshold: usize,
    /// Events that a failed dispatch attempted and kept; they do not count
    /// towards the next threshold
    threshold_base: AtomicUsize,
    threshold_signal: Notify,
}

impl RecordBuffers {
    pub fn new(capacity: usize, ceiling: usize, batch_threshold: usize, ab_mode: &str) -> Self {
        Self {
            events: Mutex::new(RecordPool::with_capacity(RecordKind::Event, capacity, ceiling)),
            properties: Mutex::new(RecordPool::with_capacity(
                RecordKind::Property,
                capacity,
                ceiling,
            )),
            sessions: Mutex::new(SessionBook::new(capacity, ceiling, ab_mode)),
            batch_threshold,
            threshold_base: AtomicUsize::new(0),
            threshold_signal: Notify::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.pool_capacity,
            config.pool_ceiling,
            config.batch_threshold,
            &config.ab_mode,
        )
    }

    pub fn events(&self) -> MutexGuard<'_, RecordPool<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn properties(&self) -> MutexGuard<'_, RecordPool<Property>> {
        self.properties.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sessions(&self) -> MutexGuard<'_, SessionBook> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn batch_threshold(&self) -> usize {
        self.batch_threshold
    }

    /// Wake the scheduler when `pending_events` holds a threshold's worth of
    /// events that no dispatch has attempted yet.
    pub fn signal_if_due(&self, pending_events: usize) {
        if self.is_due(pending_events) {
            self.threshold_signal.notify_one();
        }
    }

    fn is_due(&self, pending_events: usize) -> bool {
        let attempted = self.threshold_base.load(Ordering::SeqCst);
        pending_events.saturating_sub(attempted) >= self.batch_threshold
    }

    fn threshold_reached(&self) -> bool {
        self.is_due(self.events().busy_count())
    }

    fn rearm_threshold(&self, retained_events: usize) {
        self.threshold_base.store(retained_events, Ordering::SeqCst);
    }

    /// Remove the in-flight records of `kind` after none of them could be encoded.
    fn drop_in_flight(&self, kind: RecordKind) -> usize {
        fn drop_prefix<T: PoolRecord>(pool: &mut RecordPool<T>) -> usize {
            let marked = pool.in_flight();
            pool.compact(marked);
            pool.release_in_flight();
            marked
        }

        match kind {
            RecordKind::Event => drop_prefix(&mut *self.events()),
            RecordKind::Property => drop_prefix(&mut *self.properties()),
            RecordKind::Session => drop_prefix(self.sessions().pool_mut()),
        }
    }

    pub fn pending(&self) -> PendingCounts {
        PendingCounts {
            events: self.events().busy_count(),
            properties: self.properties().busy_count(),
            sessions: self.sessions().pool().busy_count(),
        }
    }
}

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Not running
    Idle,
    /// Running, waiting for the timer or the threshold
    Waiting,
    /// Per-kind sends in progress
    Sending,
    /// Settling pools after the sends returned
    Compacting,
}

/// What caused a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Interval,
    Threshold,
    Manual,
}

/// Per-kind result of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindOutcome {
    /// Nothing was buffered, no call was made
    Empty,
    /// The collector acknowledged `records` records
    Delivered { records: usize },
    /// The send failed; `retained` records stay buffered
    Failed { retained: usize },
}

/// Summary of one dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub trigger: Trigger,
    pub events: KindOutcome,
    pub properties: KindOutcome,
    pub sessions: KindOutcome,
    /// Records left out of their batch because they could not be serialized
    pub skipped_records: usize,
    /// Nothing was attempted because the user id is not established yet
    pub identity_pending: bool,
}

impl DispatchReport {
    fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            events: KindOutcome::Empty,
            properties: KindOutcome::Empty,
            sessions: KindOutcome::Empty,
            skipped_records: 0,
            identity_pending: false,
        }
    }

    pub fn outcome(&self, kind: RecordKind) -> KindOutcome {
        match kind {
            RecordKind::Event => self.events,
            RecordKind::Property => self.properties,
            RecordKind::Session => self.sessions,
        }
    }

    /// True when no kind failed.
    pub fn is_success(&self) -> bool {
        !self.identity_pending
            && RecordKind::all()
                .iter()
                .all(|kind| !matches!(self.outcome(*kind), KindOutcome::Failed { .. }))
    }
}

/// Statistics about dispatch cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Dispatch cycles that reached the sending stage
    pub dispatches: u64,

    /// Dispatches started by the event threshold
    pub threshold_flushes: u64,

    /// Dispatches started by the interval timer
    pub interval_flushes: u64,

    /// Dispatches requested by the host
    pub manual_flushes: u64,

    /// Batches acknowledged by the collector
    pub batches_delivered: u64,

    /// Batches that failed and were retained
    pub batches_failed: u64,

    /// Records acknowledged by the collector
    pub records_delivered: u64,

    /// Records skipped because they could not be serialized
    pub records_skipped: u64,
}

/// A batch cut from one pool plus what was left out of it.
#[derive(Default)]
struct Prepared {
    batch: Option<Batch>,
    skipped: usize,
}

type SendResult = Option<Result<DeliveryReport, DeliveryError>>;

/// Drains the record pools to the collector.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use telemetry_spool::config::Config;
/// use telemetry_spool::identity::{IdentityRegistrar, MemoryIdentityStore};
/// use telemetry_spool::scheduler::{DispatchScheduler, RecordBuffers, SchedulerConfig};
/// use telemetry_spool::time::TimeReconciler;
/// use telemetry_spool::transport::HttpTransport;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let transport = Arc::new(HttpTransport::new(&config).unwrap());
///     let buffers = Arc::new(RecordBuffers::from_config(&config));
///     let reconciler = Arc::new(TimeReconciler::new(transport.clone(), config.time_retry_interval));
///     let registrar = Arc::new(IdentityRegistrar::new(
///         transport.clone(),
///         Arc::new(MemoryIdentityStore::new()),
///         config.registration_retry_interval,
///     ));
///
///     let scheduler = DispatchScheduler::new(
///         SchedulerConfig::from(&config),
///         buffers,
///         transport,
///         reconciler,
///         registrar,
///         config.app_version.clone(),
///     );
///     scheduler.run(CancellationToken::new()).await;
/// }
/// ```
pub struct DispatchScheduler {
    config: SchedulerConfig,
    buffers: Arc<RecordBuffers>,
    transport: Arc<dyn Transport>,
    reconciler: Arc<TimeReconciler>,
    registrar: Arc<IdentityRegistrar>,
    app_version: String,
    /// Held for a whole dispatch; at most one send per kind is in flight
    send_guard: tokio::sync::Mutex<()>,
    running: AtomicBool,
    state: watch::Sender<SchedulerState>,
    stats: Mutex<SchedulerStats>,
}

impl DispatchScheduler {
    pub fn new(
        config: SchedulerConfig,
        buffers: Arc<RecordBuffers>,
        transport: Arc<dyn Transport>,
        reconciler: Arc<TimeReconciler>,
        registrar: Arc<IdentityRegistrar>,
        app_version: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            config,
            buffers,
            transport,
            reconciler,
            registrar,
            app_version: app_version.into(),
            send_guard: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            state,
            stats: Mutex::new(SchedulerStats::default()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }

    /// Dispatch on the interval or the event threshold until `cancel` fires.
    ///
    /// Every dispatch restarts the interval. Cancellation is only observed
    /// between dispatches, so a cycle in progress always settles its pools.
    pub async fn run(&self, cancel: CancellationToken) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            interval_secs = self.config.send_interval.as_secs(),
            batch_threshold = self.config.batch_threshold,
            "Dispatch scheduler started"
        );

        let timer = tokio::time::sleep(self.config.send_interval);
        tokio::pin!(timer);
        self.set_state(SchedulerState::Waiting);

        loop {
            let trigger = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.buffers.threshold_signal.notified() => {
                    // Stale wakeups from records already sent are ignored.
                    if !self.buffers.threshold_reached() {
                        continue;
                    }
                    Trigger::Threshold
                }
                _ = &mut timer => Trigger::Interval,
            };

            debug!(trigger = ?trigger, "Dispatch triggered");
            self.dispatch(trigger).await;
            timer
                .as_mut()
                .reset(Instant::now() + self.config.send_interval);
        }

        self.running.store(false, Ordering::SeqCst);
        self.set_state(SchedulerState::Idle);
        info!("Dispatch scheduler stopped");
    }

    /// Dispatch immediately, waiting for any dispatch already in progress.
    pub async fn flush_now(&self) -> DispatchReport {
        self.dispatch(Trigger::Manual).await
    }

    async fn dispatch(&self, trigger: Trigger) -> DispatchReport {
        let _guard = self.send_guard.lock().await;
        let mut report = DispatchReport::new(trigger);

        let user_id = self.registrar.user_id();
        if user_id < 0 {
            debug!(trigger = ?trigger, "Identity not established yet, skipping dispatch");
            report.identity_pending = true;
            return report;
        }

        self.set_state(SchedulerState::Sending);
        let ctx = WireContext {
            user_id,
            app_version: &self.app_version,
        };
        let estimate = self.reconciler.current();

        // Pools are only locked to reconcile and copy; encoding runs unlocked.
        let events = snapshot(&mut *self.buffers.events(), estimate.as_ref());
        let properties = snapshot(&mut *self.buffers.properties(), estimate.as_ref());
        let sessions = snapshot(self.buffers.sessions().pool_mut(), estimate.as_ref());

        let events = self.encode(RecordKind::Event, events, &ctx);
        let properties = self.encode(RecordKind::Property, properties, &ctx);
        let sessions = self.encode(RecordKind::Session, sessions, &ctx);
        report.skipped_records = events.skipped + properties.skipped + sessions.skipped;

        let (events_sent, properties_sent, sessions_sent) = tokio::join!(
            self.deliver(events.batch),
            self.deliver(properties.batch),
            self.deliver(sessions.batch),
        );

        self.set_state(SchedulerState::Compacting);
        let attempted_events = {
            let mut pool = self.buffers.events();
            let attempted = pool.in_flight();
            report.events = settle(&mut *pool, &events_sent);
            attempted
        };
        self.buffers.rearm_threshold(match report.events {
            KindOutcome::Failed { .. } => attempted_events,
            _ => 0,
        });
        report.properties = settle(&mut *self.buffers.properties(), &properties_sent);
        report.sessions = settle_sessions(&mut *self.buffers.sessions(), &sessions_sent);

        self.record(&report);
        self.set_state(if self.running.load(Ordering::SeqCst) {
            SchedulerState::Waiting
        } else {
            SchedulerState::Idle
        });
        report
    }

    /// Encode a snapshot into a batch. If nothing in it is serializable the
    /// in-flight records are dropped so they cannot block the pool.
    fn encode<T: WireRecord>(
        &self,
        kind: RecordKind,
        records: Option<Vec<T>>,
        ctx: &WireContext<'_>,
    ) -> Prepared {
        let Some(records) = records else {
            return Prepared::default();
        };

        let encoded = encode_batch(records.iter(), ctx);
        let skipped = encoded.skipped;

        if encoded.is_empty() {
            let dropped = self.buffers.drop_in_flight(kind);
            warn!(
                kind = %kind,
                records = dropped,
                "No buffered record could be serialized, dropping them"
            );
            return Prepared {
                batch: None,
                skipped,
            };
        }

        Prepared {
            batch: Some(Batch::new(kind, ctx.user_id, encoded)),
            skipped,
        }
    }

    async fn deliver(&self, batch: Option<Batch>) -> SendResult {
        let batch = batch?;
        let result = self.transport.send_batch(&batch).await;

        match &result {
            Ok(delivery) => debug!(
                kind = %batch.kind,
                records = batch.record_count,
                attempts = delivery.attempts,
                "Batch delivered"
            ),
            Err(e) => warn!(
                kind = %batch.kind,
                records = batch.record_count,
                error = %e,
                "Batch delivery failed, records retained"
            ),
        }
        Some(result)
    }

    fn record(&self, report: &DispatchReport) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.dispatches += 1;
        match report.trigger {
            Trigger::Interval => stats.interval_flushes += 1,
            Trigger::Threshold => stats.threshold_flushes += 1,
            Trigger::Manual => stats.manual_flushes += 1,
        }
        stats.records_skipped += report.skipped_records as u64;

        for kind in RecordKind::all() {
            match report.outcome(*kind) {
                KindOutcome::Delivered { records } => {
                    stats.batches_delivered += 1;
                    stats.records_delivered += records as u64;
                }
                KindOutcome::Failed { .. } => stats.batches_failed += 1,
                KindOutcome::Empty => {}
            }
        }
    }
}

/// Reconcile the busy records of `pool`, mark them in flight and copy them out.
fn snapshot<T>(pool: &mut RecordPool<T>, estimate: Option<&TimeEstimate>) -> Option<Vec<T>>
where
    T: PoolRecord + Timestamped + Clone,
{
    if pool.is_empty() {
        return None;
    }

    if let Some(estimate) = estimate {
        pool.for_each_busy_mut(|record| {
            estimate.apply(record);
        });
    }

    pool.mark_in_flight();
    Some(pool.snapshot_view().cloned().collect())
}

/// Compact delivered records, or keep everything after a failure.
fn settle<T: PoolRecord>(pool: &mut RecordPool<T>, sent: &SendResult) -> KindOutcome {
    match sent {
        None => KindOutcome::Empty,
        Some(Ok(_)) => {
            let delivered = pool.in_flight();
            pool.compact(delivered);
            pool.release_in_flight();
            KindOutcome::Delivered { records: delivered }
        }
        Some(Err(_)) => {
            pool.release_in_flight();
            KindOutcome::Failed {
                retained: pool.busy_count(),
            }
        }
    }
}

fn settle_sessions(book: &mut SessionBook, sent: &SendResult) -> KindOutcome {
    match sent {
        None => KindOutcome::Empty,
        Some(Ok(_)) => {
            let delivered = book.pool().in_flight();
            book.settle_delivered();
            KindOutcome::Delivered { records: delivered }
        }
        Some(Err(_)) => {
            book.pool_mut().release_in_flight();
            KindOutcome::Failed {
                retained: book.pool().busy_count(),
            }
        }
    }
}
