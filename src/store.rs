//! Preference store
//!
//! Durable key-value persistence for the [`UserProfile`]. Writes go through a
//! single async lock and replace the whole record at once, so a reader never
//! sees a mix of old and new fields. Every successful write is published on a
//! `watch` channel that backs [`ProfileStream`].

use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::error::SyncError;
use crate::types::UserProfile;

/// Flat string entries as persisted
pub type Entries = BTreeMap<String, String>;

/// Storage medium for the preference entries.
///
/// `write_all` must replace the stored entries atomically.
pub trait KeyValueBackend: Send + Sync {
    fn read_all(&self) -> Result<Entries, SyncError>;
    fn write_all(&self, entries: &Entries) -> Result<(), SyncError>;
}

/// Volatile backend for tests and previews
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<Entries>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Entries) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl KeyValueBackend for MemoryBackend {
    fn read_all(&self) -> Result<Entries, SyncError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| SyncError::Storage("memory backend poisoned".to_string()))?;
        Ok(entries.clone())
    }

    fn write_all(&self, entries: &Entries) -> Result<(), SyncError> {
        let mut stored = self
            .entries
            .lock()
            .map_err(|_| SyncError::Storage("memory backend poisoned".to_string()))?;
        *stored = entries.clone();
        Ok(())
    }
}

/// JSON file of string entries, replaced via temp file + fsync + rename
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "preferences".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl KeyValueBackend for JsonFileBackend {
    fn read_all(&self) -> Result<Entries, SyncError> {
        read_json_or_default(&self.path)
    }

    fn write_all(&self, entries: &Entries) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(entries)?;
        let tmp_path = self.temp_path();
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// Missing or blank file reads as the default value
fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, SyncError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(&content)?)
}

/// Durable owner of the user profile
pub struct PreferenceStore {
    backend: Arc<dyn KeyValueBackend>,
    write_lock: tokio::sync::Mutex<()>,
    published: watch::Sender<UserProfile>,
}

impl PreferenceStore {
    /// Open a store over `backend`, loading the current record
    pub fn open(backend: Arc<dyn KeyValueBackend>) -> Result<Self, SyncError> {
        let initial = UserProfile::from_entries(&backend.read_all()?);
        let (published, _) = watch::channel(initial);
        Ok(Self {
            backend,
            write_lock: tokio::sync::Mutex::new(()),
            published,
        })
    }

    pub fn in_memory() -> Self {
        let (published, _) = watch::channel(UserProfile::default());
        Self {
            backend: Arc::new(MemoryBackend::new()),
            write_lock: tokio::sync::Mutex::new(()),
            published,
        }
    }

    pub fn json_file(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        Self::open(Arc::new(JsonFileBackend::new(path)))
    }

    /// Stream that yields the current profile first, then each saved one
    pub fn observe_profile(&self) -> ProfileStream {
        ProfileStream {
            rx: self.published.subscribe(),
            primed: false,
        }
    }

    /// Last successfully persisted profile
    pub fn load_profile(&self) -> UserProfile {
        self.published.borrow().clone()
    }

    /// Atomically overwrite every field with `profile`
    pub async fn save_profile(&self, profile: &UserProfile) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;
        self.persist(profile.clone())
    }

    /// Read-modify-write under the write lock.
    ///
    /// Returns the profile that was persisted.
    pub async fn update<F>(&self, edit: F) -> Result<UserProfile, SyncError>
    where
        F: FnOnce(&mut UserProfile),
    {
        let _guard = self.write_lock.lock().await;
        let mut profile = self.load_profile();
        edit(&mut profile);
        self.persist(profile.clone())?;
        Ok(profile)
    }

    fn persist(&self, profile: UserProfile) -> Result<(), SyncError> {
        self.backend.write_all(&profile.to_entries())?;
        tracing::debug!("Saved user profile");
        self.published.send_replace(profile);
        Ok(())
    }
}

/// Reactive view over the persisted profile.
///
/// Intermediate values are coalesced when the consumer falls behind; the
/// latest saved profile is always delivered.
pub struct ProfileStream {
    rx: watch::Receiver<UserProfile>,
    primed: bool,
}

impl ProfileStream {
    /// Next profile; `None` once the store is dropped
    pub async fn next(&mut self) -> Option<UserProfile> {
        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

/// Serialize a value as the pretty JSON the CLI and FFI hand out
pub fn to_pretty_json<T: Serialize>(value: &T) -> Result<String, SyncError> {
    Ok(serde_json::to_string_pretty(value)?)
}
