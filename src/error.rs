//! Error types for wellness-sync

use thiserror::Error;

use crate::types::ProfileField;

/// Errors that can occur while syncing, persisting or submitting a profile
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Health data access not authorized")]
    AuthorizationDenied,

    #[error("Health data provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Health data query timed out after {0}s")]
    Timeout(u64),

    #[error("A sync is already in progress")]
    SyncInProgress,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(ProfileField),

    #[error("Invalid number format in input fields: {0}")]
    InvalidNumber(ProfileField),

    #[error("Unknown profile field: {0}")]
    UnknownField(String),

    #[error("Invalid choice for {field}: {value}")]
    InvalidChoice { field: ProfileField, value: String },

    #[error("Prediction request failed with status {status} - {reason}")]
    PredictionStatus { status: u16, reason: String },

    #[error("Prediction transport error: {0}")]
    PredictionTransport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Text shown to the user for this error.
    ///
    /// Validation and prediction failures keep the wording the app has always
    /// shown; everything raised inside a fetch cycle is prefixed so the user
    /// can tell it came from the health data sync.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::AuthorizationDenied => {
                "Permission denied. The app needs access to health data.".to_string()
            }
            SyncError::MissingField(_) => "Please fill in all required fields".to_string(),
            SyncError::InvalidNumber(field) => {
                format!("Invalid number format in input fields: {}", field)
            }
            SyncError::InvalidChoice { field, value } => {
                format!("'{}' is not a valid {}", value, field)
            }
            SyncError::PredictionStatus { status, reason } => {
                format!("Failed to get prediction: {} - {}", status, reason)
            }
            SyncError::PredictionTransport(msg) => format!("Error: {}", msg),
            SyncError::UnknownField(key) => format!("Unknown profile field '{}'", key),
            SyncError::SyncInProgress => "A sync is already running".to_string(),
            other => format!("Failed to fetch data: {}", other),
        }
    }

    /// True for errors caused by user input rather than the environment
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SyncError::MissingField(_)
                | SyncError::InvalidNumber(_)
                | SyncError::InvalidChoice { .. }
                | SyncError::UnknownField(_)
        )
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(e: toml::de::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::PredictionTransport(e.to_string())
    }
}
