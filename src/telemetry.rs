//! The engine's public handle.
//!
//! [`Telemetry`] owns one context (pools, time reconciler, identity registrar,
//! scheduler) and the two background tasks that drive it. Producer calls only
//! touch in-memory pools and never wait on the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{IdentityError, PersistenceError, TransportError};
use crate::identity::{FileIdentityStore, Identity, IdentityRegistrar, IdentityStore, RegistrationOutcome};
use crate::model::{Event, Parameter, RecordKind, ValueRef};
use crate::persistence::{restore_pool, save_pool, DurablePersistence, FilePersistence};
use crate::pool::PoolStats;
use crate::scheduler::{
    DispatchReport, DispatchScheduler, PendingCounts, RecordBuffers, SchedulerConfig,
    SchedulerState, SchedulerStats,
};
use crate::time::TimeReconciler;
use crate::transport::{HttpTransport, Transport};

/// Property table for user attributes written by the engine itself.
pub const USERS_TABLE: &str = "users";

/// Property table for producer-defined properties.
pub const CUSTOM_PROPERTIES_TABLE: &str = "custom_properties";

/// How long shutdown waits for each background task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot of engine counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryStats {
    pub user_id: i64,
    pub has_time_estimate: bool,
    pub scheduler_state: SchedulerState,
    pub pending: PendingCounts,
    pub events: PoolStats,
    pub properties: PoolStats,
    pub sessions: PoolStats,
    pub scheduler: SchedulerStats,
}

/// Appends parameters to the event being recorded.
pub struct EventWriter<'a> {
    event: &'a mut Event,
}

impl EventWriter<'_> {
    pub fn param<'v>(&mut self, name: &str, value: impl Into<ValueRef<'v>>) -> &mut Self {
        self.event.push_param(name, value.into());
        self
    }
}

struct Inner {
    config: Config,
    buffers: Arc<RecordBuffers>,
    reconciler: Arc<TimeReconciler>,
    registrar: Arc<IdentityRegistrar>,
    scheduler: Arc<DispatchScheduler>,
    identity_store: Arc<dyn IdentityStore>,
    persistence: Arc<dyn DurablePersistence>,
    transport: Arc<dyn Transport>,
    global_params: RwLock<Vec<Parameter>>,
    cheater: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
}

/// Cloneable handle to a telemetry context.
///
/// # Example
///
/// ```no_run
/// use telemetry_spool::config::Config;
/// use telemetry_spool::identity::Identity;
/// use telemetry_spool::telemetry::Telemetry;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::from_env().expect("Failed to load config");
///     let telemetry = Telemetry::from_config(config.clone()).expect("Failed to build telemetry");
///
///     telemetry.init(Identity::new(config.platform.clone(), "device-1", None));
///     telemetry.record_event("level_start", &[("level", 3i64.into()), ("hard", true.into())]);
///     telemetry.set_property("coins", 120i64);
///
///     telemetry.shutdown().await.ok();
/// }
/// ```
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

impl Telemetry {
    /// Build a context and load any records persisted by a previous run.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        identity_store: Arc<dyn IdentityStore>,
        persistence: Arc<dyn DurablePersistence>,
    ) -> Self {
        let buffers = Arc::new(RecordBuffers::from_config(&config));
        restore_buffers(&buffers, persistence.as_ref());

        let reconciler = Arc::new(TimeReconciler::new(
            transport.clone(),
            config.time_retry_interval,
        ));
        let registrar = Arc::new(IdentityRegistrar::new(
            transport.clone(),
            identity_store.clone(),
            config.registration_retry_interval,
        ));
        let scheduler = Arc::new(DispatchScheduler::new(
            SchedulerConfig::from(&config),
            buffers.clone(),
            transport.clone(),
            reconciler.clone(),
            registrar.clone(),
            config.app_version.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                buffers,
                reconciler,
                registrar,
                scheduler,
                identity_store,
                persistence,
                transport,
                global_params: RwLock::new(Vec::new()),
                cheater: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Build a context with the HTTP transport and file stores under `cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` if the HTTP client cannot be built.
    pub fn from_config(config: Config) -> Result<Self, TransportError> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        let identity_store = Arc::new(FileIdentityStore::new(&config.cache_dir));
        let persistence = Arc::new(FilePersistence::new(&config.cache_dir));
        Ok(Self::new(config, transport, identity_store, persistence))
    }

    /// Start time reconciliation and registration; dispatching begins once
    /// the user id is known. Must be called inside a tokio runtime.
    pub fn init(&self, identity: Identity) {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            warn!("Telemetry already initialized, ignoring");
            return;
        }

        info!(
            device_id = %identity.device_id,
            platform = %identity.platform,
            "Initializing telemetry"
        );

        let reconciler_task = {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.reconciler.run(&inner.cancel).await;
            })
        };

        let main_task = {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.register_and_run(identity).await;
            })
        };

        lock_tasks(&self.inner.tasks).extend([reconciler_task, main_task]);
    }

    /// Record an event with `params`, followed by the global event parameters.
    pub fn record_event(&self, name: &str, params: &[(&str, ValueRef<'_>)]) {
        self.record_event_with(name, |writer| {
            for (param, value) in params {
                writer.param(param, *value);
            }
        });
    }

    /// Record an event, writing its parameters through `write`.
    ///
    /// `write` runs while the event pool is locked; keep it short.
    pub fn record_event_with(&self, name: &str, write: impl FnOnce(&mut EventWriter<'_>)) {
        let pending = {
            let mut events = self.inner.buffers.events();
            let event = events.allocate();
            event.set_name(name);
            event.set_timestamp(Utc::now());

            let mut writer = EventWriter { event };
            write(&mut writer);

            let globals = self
                .inner
                .global_params
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for param in globals.iter() {
                writer.event.push_param(&param.name, param.value.as_value_ref());
            }
            drop(globals);

            events.busy_count()
        };
        self.inner.buffers.signal_if_due(pending);
    }

    /// Set a producer property, replacing an unsent value of the same name.
    pub fn set_property<'v>(&self, name: &str, value: impl Into<ValueRef<'v>>) {
        self.inner
            .write_property(CUSTOM_PROPERTIES_TABLE, name, value.into());
    }

    /// Attach `name = value` to every event recorded from now on.
    pub fn set_global_event_param<'v>(&self, name: &str, value: impl Into<ValueRef<'v>>) {
        let value = value.into();
        let mut globals = self
            .inner
            .global_params
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        match globals.iter_mut().find(|param| param.name == name) {
            Some(param) => param.value.assign(value),
            None => globals.push(Parameter::new(name, value.to_owned_value())),
        }
    }

    pub fn remove_global_event_param(&self, name: &str) {
        self.inner
            .global_params
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|param| param.name != name);
    }

    pub fn set_cheater(&self, cheater: bool) {
        self.inner.cheater.store(cheater, Ordering::SeqCst);
        self.inner
            .write_property(USERS_TABLE, "cheater", ValueRef::Bool(cheater));
    }

    pub fn set_traffic_source(&self, source: &str) {
        self.inner
            .write_property(USERS_TABLE, "traffic", ValueRef::from(source));
    }

    /// Open a new session, inheriting area and A/B mode from the previous one.
    pub fn start_session(&self) {
        self.inner.begin_session(None);
    }

    /// Mark the current session as active now.
    pub fn register_activity(&self) {
        let estimate = self.inner.reconciler.current();
        self.inner
            .buffers
            .sessions()
            .register_activity(Utc::now(), estimate.as_ref());
    }

    pub fn set_area(&self, area: i32) {
        self.inner.buffers.sessions().set_area(area);
    }

    pub fn set_ab_mode(&self, ab_mode: &str) {
        self.inner.buffers.sessions().set_ab_mode(ab_mode);
    }

    /// Send everything buffered now, without waiting for the timer.
    pub async fn flush_now(&self) -> DispatchReport {
        self.inner.scheduler.flush_now().await
    }

    /// The registered identity, once registration has completed.
    pub fn identity(&self) -> Option<Identity> {
        self.inner.registrar.current()
    }

    pub fn user_id(&self) -> i64 {
        self.inner.registrar.user_id()
    }

    /// Best known server time.
    pub fn server_now(&self) -> DateTime<Utc> {
        self.inner.reconciler.server_now()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn stats(&self) -> TelemetryStats {
        let buffers = &self.inner.buffers;
        let events = buffers.events().stats().clone();
        let properties = buffers.properties().stats().clone();
        let sessions = buffers.sessions().pool().stats().clone();

        TelemetryStats {
            user_id: self.user_id(),
            has_time_estimate: self.inner.reconciler.has_estimate(),
            scheduler_state: self.inner.scheduler.state(),
            pending: buffers.pending(),
            events,
            properties,
            sessions,
            scheduler: self.inner.scheduler.stats(),
        }
    }

    /// Stop the background tasks and persist every unsent record.
    ///
    /// A dispatch in progress is allowed to finish (bounded by a timeout)
    /// so its pools are settled before they are saved.
    ///
    /// # Errors
    ///
    /// Returns the first persistence error; the other kinds are still saved.
    pub async fn shutdown(&self) -> Result<(), PersistenceError> {
        info!("Shutting down telemetry");
        self.inner.cancel.cancel();

        let handles = std::mem::take(&mut *lock_tasks(&self.inner.tasks));
        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Telemetry task panicked during shutdown"),
                Err(_) => warn!(
                    timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                    "Telemetry task shutdown timed out"
                ),
            }
        }

        self.save_cache_locally()
    }

    /// Persist every unsent record without stopping anything.
    ///
    /// # Errors
    ///
    /// Returns the first persistence error; the other kinds are still saved.
    pub fn save_cache_locally(&self) -> Result<(), PersistenceError> {
        let persistence = self.inner.persistence.as_ref();
        let buffers = &self.inner.buffers;

        let mut outcome = Ok(());
        for kind in RecordKind::all() {
            let result = match kind {
                RecordKind::Event => save_pool(persistence, &*buffers.events()),
                RecordKind::Property => save_pool(persistence, &*buffers.properties()),
                RecordKind::Session => save_pool(persistence, buffers.sessions().pool()),
            };
            if let Err(e) = result {
                warn!(kind = %kind, error = %e, "Failed to save unsent records");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}

impl Inner {
    async fn register_and_run(&self, local: Identity) {
        let ab_mode = self.buffers.sessions().ab_mode().to_string();

        let outcome = match self
            .registrar
            .register_or_resume(local, &ab_mode, &self.config.app_version, &self.cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(IdentityError::Cancelled) => {
                info!("Registration cancelled before an id was assigned");
                return;
            }
        };

        self.begin_session(outcome.session_count);
        self.write_user_details(&outcome);
        tokio::join!(self.write_country(), self.scheduler.run(self.cancel.clone()));
    }

    async fn write_country(&self) {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            result = self.transport.fetch_country() => result,
        };

        match result {
            Ok(Some(country)) => {
                self.write_property(USERS_TABLE, "country", ValueRef::from(country.as_str()))
            }
            Ok(None) => debug!("Country lookup returned no country"),
            Err(e) => warn!(error = %e, "Country lookup failed"),
        }
    }

    fn begin_session(&self, server_count: Option<i64>) {
        let mut sessions = self.buffers.sessions();
        let session = sessions.start_session(Utc::now(), server_count);
        debug!(
            session_count = session.session_count(),
            area = session.area(),
            "New session opened"
        );
    }

    fn write_property(&self, table: &str, name: &str, value: ValueRef<'_>) {
        let now = Utc::now();
        let mut properties = self.buffers.properties();

        match properties.find_unsent_mut(|property| property.matches(table, name)) {
            Some(existing) => existing.set(table, name, value, now),
            None => properties.allocate().set(table, name, value, now),
        }
    }

    /// Install and version attributes written once per launch after registration.
    fn write_user_details(&self, outcome: &RegistrationOutcome) {
        let version = self.config.app_version.as_str();
        let now = Utc::now();
        let remembered = self.identity_store.load_app_version().unwrap_or_else(|e| {
            warn!(error = %e, "Could not read remembered app version");
            None
        });

        if outcome.created {
            if !self.cheater.load(Ordering::SeqCst) {
                self.write_property(USERS_TABLE, "cheater", ValueRef::Bool(false));
            }
            self.write_property(USERS_TABLE, "tester", ValueRef::Bool(outcome.tester));
            self.write_property(USERS_TABLE, "first_install_date", ValueRef::DateTime(now));
            self.write_property(USERS_TABLE, "last_install_date", ValueRef::DateTime(now));
            self.write_property(USERS_TABLE, "first_game_version", ValueRef::from(version));
            let ab_mode = self.buffers.sessions().ab_mode().to_string();
            self.write_property(
                CUSTOM_PROPERTIES_TABLE,
                "first_ab_mode",
                ValueRef::from(ab_mode.as_str()),
            );
        } else {
            match remembered.as_deref() {
                None => {
                    self.write_property(USERS_TABLE, "last_install_date", ValueRef::DateTime(now))
                }
                Some(previous) if previous != version => {
                    self.write_property(USERS_TABLE, "last_update_date", ValueRef::DateTime(now))
                }
                Some(_) => {}
            }
        }

        self.write_property(USERS_TABLE, "current_game_version", ValueRef::from(version));
        self.write_property(USERS_TABLE, "os", ValueRef::from(self.config.platform.as_str()));

        if let Err(e) = self.identity_store.save_app_version(version) {
            warn!(error = %e, "Failed to remember app version");
        }
    }
}

fn lock_tasks(tasks: &Mutex<Vec<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Load the records a previous run persisted; failures only cost those records.
fn restore_buffers(buffers: &RecordBuffers, persistence: &dyn DurablePersistence) {
    for kind in RecordKind::all() {
        let result = match kind {
            RecordKind::Event => restore_pool(persistence, &mut *buffers.events()),
            RecordKind::Property => restore_pool(persistence, &mut *buffers.properties()),
            RecordKind::Session => {
                let mut sessions = buffers.sessions();
                let restored = restore_pool(persistence, sessions.pool_mut());
                sessions.sync_from_pool();
                restored
            }
        };
        if let Err(e) = result {
            warn!(kind = %kind, error = %e, "Failed to load persisted records");
        }
    }

    buffers.signal_if_due(buffers.events().busy_count());
}
