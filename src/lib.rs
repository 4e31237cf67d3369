//! Wellness Sync - On-device reconciliation of platform health data
//!
//! Reads today's steps, sleep and heart rate from the platform health store,
//! merges them into the persisted wellness profile without clobbering fields
//! the user is editing, and converts the profile into a stress prediction
//! request.
//!
//! ## Modules
//!
//! - **Health**: permission-gated, time-bounded reads from a health data provider
//! - **Store**: durable, observable key-value persistence of the profile
//! - **Reconcile**: fetch cycles, the edit guard and the merge rules
//! - **Prediction**: profile validation and the remote stress prediction call

pub mod config;
pub mod error;
pub mod health;
pub mod prediction;
pub mod reconcile;
pub mod store;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use config::SyncConfig;
pub use error::SyncError;
pub use health::{HealthDataProvider, HealthDataReader, JsonExportProvider, RecordType, TimeWindow};
pub use prediction::{submit_prediction, HttpPredictionClient, PredictionClient, StressPredictionRequest};
pub use reconcile::{merge_snapshot, EditGuard, ReconciliationEngine, StartOutcome, SyncStatus, SyncTrigger};
pub use store::{PreferenceStore, ProfileStream};
pub use types::{FetchSnapshot, ProfileField, SleepSession, UserProfile};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by the CLI
pub const PRODUCER_NAME: &str = "wellness-sync";
