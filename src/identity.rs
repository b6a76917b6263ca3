//! Device identity and its one-time registration.
//!
//! A device starts with `user_id == -1`. The [`IdentityRegistrar`] asks the
//! registration service for a real id on a fixed retry interval until one
//! arrives, persists it through an [`IdentityStore`], and on later launches
//! reuses the stored id without any network call.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{IdentityError, PersistenceError};
use crate::transport::{RegistrationRequest, Transport};

/// Wait between registration attempts that did not yield an id.
pub const DEFAULT_REGISTRATION_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// User id of a device the registration service has not resolved yet.
pub const UNESTABLISHED_USER_ID: i64 = -1;

const IDENTITY_FILE: &str = "identity.json";
const APP_VERSION_FILE: &str = "app_version";
const DEVICE_ID_FILE: &str = "device_id";

/// Who this device is, as far as the collector is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: i64,
    pub platform: String,
    pub device_id: String,
    pub advertising_id: Option<String>,
}

impl Identity {
    /// A local identity awaiting registration.
    pub fn new(
        platform: impl Into<String>,
        device_id: impl Into<String>,
        advertising_id: Option<String>,
    ) -> Self {
        Self {
            user_id: UNESTABLISHED_USER_ID,
            platform: platform.into(),
            device_id: device_id.into(),
            advertising_id,
        }
    }

    pub fn is_established(&self) -> bool {
        self.user_id >= 0
    }
}

/// Durable home for the identity and the last seen application version.
pub trait IdentityStore: Send + Sync {
    fn load(&self) -> Result<Option<Identity>, PersistenceError>;

    fn save(&self, identity: &Identity) -> Result<(), PersistenceError>;

    fn load_app_version(&self) -> Result<Option<String>, PersistenceError>;

    fn save_app_version(&self, version: &str) -> Result<(), PersistenceError>;
}

/// [`IdentityStore`] backed by small files in a cache directory.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    dir: PathBuf,
}

impl FileIdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return the stored device id, generating and persisting one on first use.
    pub fn load_or_create_device_id(&self) -> Result<String, PersistenceError> {
        if let Some(existing) = self.read_trimmed(DEVICE_ID_FILE)? {
            return Ok(existing);
        }

        let device_id = Uuid::new_v4().simple().to_string();
        self.write_atomic(DEVICE_ID_FILE, device_id.as_bytes())?;
        info!(device_id = %device_id, "Generated new device id");
        Ok(device_id)
    }

    fn read_trimmed(&self, name: &str) -> Result<Option<String>, PersistenceError> {
        match fs::read_to_string(self.dir.join(name)) {
            Ok(text) => {
                let text = text.trim();
                Ok((!text.is_empty()).then(|| text.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic(&self, name: &str, contents: &[u8]) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<Identity>, PersistenceError> {
        let Some(text) = self.read_trimmed(IDENTITY_FILE)? else {
            return Ok(None);
        };

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| PersistenceError::Corrupt {
                what: IDENTITY_FILE.to_string(),
                reason: e.to_string(),
            })
    }

    fn save(&self, identity: &Identity) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(identity).map_err(|e| PersistenceError::Corrupt {
            what: IDENTITY_FILE.to_string(),
            reason: e.to_string(),
        })?;
        self.write_atomic(IDENTITY_FILE, &json)
    }

    fn load_app_version(&self) -> Result<Option<String>, PersistenceError> {
        self.read_trimmed(APP_VERSION_FILE)
    }

    fn save_app_version(&self, version: &str) -> Result<(), PersistenceError> {
        self.write_atomic(APP_VERSION_FILE, version.as_bytes())
    }
}

/// In-memory [`IdentityStore`]; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identity: Mutex<Option<Identity>>,
    app_version: Mutex<Option<String>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `identity`, as if a previous run saved it.
    pub fn with_identity(identity: Identity) -> Self {
        Self {
            identity: Mutex::new(Some(identity)),
            app_version: Mutex::new(None),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<Identity>, PersistenceError> {
        Ok(self
            .identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, identity: &Identity) -> Result<(), PersistenceError> {
        *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = Some(identity.clone());
        Ok(())
    }

    fn load_app_version(&self) -> Result<Option<String>, PersistenceError> {
        Ok(self
            .app_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save_app_version(&self, version: &str) -> Result<(), PersistenceError> {
        *self.app_version.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(version.to_string());
        Ok(())
    }
}

/// Result of [`IdentityRegistrar::register_or_resume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOutcome {
    pub identity: Identity,

    /// The service reports this as a brand new user
    pub created: bool,

    /// Session count reported by the service; `None` when the id was resumed
    pub session_count: Option<i64>,

    /// Registration calls made; zero when the persisted id was reused
    pub attempts: u32,

    /// The service flags this user as a test account
    pub tester: bool,
}

/// Resolves the device's user id, once.
pub struct IdentityRegistrar {
    transport: Arc<dyn Transport>,
    store: Arc<dyn IdentityStore>,
    retry_interval: Duration,
    current: RwLock<Option<Identity>>,
}

impl IdentityRegistrar {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn IdentityStore>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            transport,
            store,
            retry_interval,
            current: RwLock::new(None),
        }
    }

    /// The established identity, if registration has completed.
    pub fn current(&self) -> Option<Identity> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The established user id, or [`UNESTABLISHED_USER_ID`].
    pub fn user_id(&self) -> i64 {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(UNESTABLISHED_USER_ID, |identity| identity.user_id)
    }

    fn publish(&self, identity: &Identity) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(identity.clone());
    }

    /// Reuse the persisted id, or register `local` until the service assigns one.
    ///
    /// Retries forever at the configured interval; only `cancel` stops it, in
    /// which case nothing is persisted and registration starts over next launch.
    ///
    /// # Errors
    ///
    /// Returns `IdentityError::Cancelled` when `cancel` fires first.
    pub async fn register_or_resume(
        &self,
        local: Identity,
        ab_mode: &str,
        app_version: &str,
        cancel: &CancellationToken,
    ) -> Result<RegistrationOutcome, IdentityError> {
        let mut outcome = self.resolve(local, ab_mode, app_version, cancel).await?;
        outcome.tester = self.lookup_tester(outcome.identity.user_id, cancel).await?;
        Ok(outcome)
    }

    /// A failed lookup counts as not a tester.
    async fn lookup_tester(
        &self,
        user_id: i64,
        cancel: &CancellationToken,
    ) -> Result<bool, IdentityError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IdentityError::Cancelled),
            result = self.transport.fetch_tester(user_id) => result,
        };

        Ok(result.unwrap_or_else(|e| {
            warn!(user_id = user_id, error = %e, "Tester lookup failed");
            false
        }))
    }

    async fn resolve(
        &self,
        local: Identity,
        ab_mode: &str,
        app_version: &str,
        cancel: &CancellationToken,
    ) -> Result<RegistrationOutcome, IdentityError> {
        let stored = self.store.load().unwrap_or_else(|e| {
            warn!(error = %e, "Persisted identity unreadable, registering again");
            None
        });

        if let Some(stored) = stored.filter(Identity::is_established) {
            let identity = Identity {
                user_id: stored.user_id,
                ..local
            };
            self.publish(&identity);
            info!(user_id = identity.user_id, "Resuming persisted identity");
            return Ok(RegistrationOutcome {
                identity,
                created: false,
                session_count: None,
                attempts: 0,
                tester: false,
            });
        }

        let initialized_before = matches!(self.store.load_app_version(), Ok(Some(_)));
        let request = RegistrationRequest::new(&local, ab_mode, app_version, initialized_before);
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IdentityError::Cancelled),
                result = self.transport.register_identity(&request) => result,
            };

            match result {
                Ok(response) if response.user_id >= 0 => {
                    let identity = Identity {
                        user_id: response.user_id,
                        ..local
                    };
                    if let Err(e) = self.store.save(&identity) {
                        warn!(error = %e, "Failed to persist identity, continuing in memory");
                    }
                    self.publish(&identity);

                    let created = response
                        .is_user_new
                        .unwrap_or(response.session_count <= 1);
                    info!(
                        user_id = identity.user_id,
                        created = created,
                        attempts = attempts,
                        "Identity registered"
                    );

                    return Ok(RegistrationOutcome {
                        identity,
                        created,
                        session_count: Some(response.session_count),
                        attempts,
                        tester: false,
                    });
                }
                Ok(response) => {
                    debug!(
                        user_id = response.user_id,
                        attempt = attempts,
                        "Registration not resolved yet"
                    );
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        attempt = attempts,
                        retry_secs = self.retry_interval.as_secs(),
                        "Registration request failed, will retry"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IdentityError::Cancelled),
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }
}
