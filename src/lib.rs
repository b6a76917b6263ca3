//! Telemetry Spool Library
//!
//! Client-side buffering and delivery of analytics records:
//!
//! - **model**: Events, properties, sessions and their wire encoding
//! - **pool**: Reusable record pools with in-flight accounting
//! - **time**: Network time reconciliation of local timestamps
//! - **identity**: Device identity persistence and registration
//! - **session**: Session numbering and activity tracking
//! - **scheduler**: Interval and threshold driven batch dispatch
//! - **transport**: HTTP client with retry logic
//! - **persistence**: Durable cache of unsent records across restarts
//! - **telemetry**: The handle hosts record through
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use telemetry_spool::config::Config;
//! use telemetry_spool::identity::Identity;
//! use telemetry_spool::telemetry::Telemetry;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let telemetry = Telemetry::from_config(config.clone()).expect("Failed to create telemetry");
//!
//!     telemetry.init(Identity::new(config.platform.clone(), "device-1", None));
//!     telemetry.record_event("app_open", &[]);
//!     telemetry.register_activity();
//!
//!     // Unsent records are cached and picked up by the next launch
//!     telemetry.shutdown().await.ok();
//! }
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod model;
pub mod persistence;
pub mod pool;
pub mod scheduler;
pub mod session;
pub mod telemetry;
pub mod time;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError, Endpoints};
pub use error::{
    CapacityError, DeliveryError, IdentityError, PersistenceError, ProtocolError,
    SerializationError, TransportError,
};
pub use identity::{FileIdentityStore, Identity, IdentityStore, MemoryIdentityStore};
pub use model::{Event, Parameter, Property, RecordKind, Session, Value, ValueRef};
pub use persistence::{DurablePersistence, FilePersistence, MemoryPersistence};
pub use scheduler::{DispatchReport, KindOutcome, SchedulerState, Trigger};
pub use telemetry::{Telemetry, TelemetryStats};
pub use time::TimeEstimate;
pub use transport::{HttpTransport, Transport};
