//! Reconciliation engine
//!
//! Combines freshly fetched health data, the persisted profile and the
//! user's in-progress edits into one profile. A fetch cycle moves through
//! `Idle -> Fetching -> Merging -> Idle`, or `Fetching -> Failed -> Idle`
//! when anything unexpected happens; a failed cycle never touches the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::SyncError;
use crate::health::{HealthDataReader, TimeWindow};
use crate::store::PreferenceStore;
use crate::types::{FetchSnapshot, ProfileField, SleepSession, UserProfile};

/// Phase of the current fetch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Merging,
    Failed,
}

/// What started a fetch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Authorization was already granted when the app started
    Startup,
    /// The user asked for a sync (after any authorization prompt)
    UserRequested,
}

/// State the presentation layer renders alongside the profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub is_fetching: bool,
    /// User-visible message from the last failed cycle
    pub error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            is_fetching: false,
            error: None,
            last_synced_at: None,
        }
    }
}

/// Result of asking the engine to start
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Synced(UserProfile),
    /// Access is missing; the host should prompt and then call
    /// [`ReconciliationEngine::authorize_and_sync`]
    NeedsAuthorization,
}

/// Health-derived fields the user is currently editing by hand
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditGuard {
    fields: BTreeSet<ProfileField>,
}

impl EditGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protect `field` from automatic merges; ignored for fields a fetch
    /// never writes
    pub fn mark(&mut self, field: ProfileField) {
        if field.is_health_derived() {
            self.fields.insert(field);
        }
    }

    pub fn is_editing(&self, field: ProfileField) -> bool {
        self.fields.contains(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = ProfileField> + '_ {
        self.fields.iter().copied()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }
}

impl FromIterator<ProfileField> for EditGuard {
    fn from_iter<I: IntoIterator<Item = ProfileField>>(iter: I) -> Self {
        let mut guard = EditGuard::new();
        for field in iter {
            guard.mark(field);
        }
        guard
    }
}

/// Total sleep in whole minutes; each session is truncated on its own
pub fn total_sleep_minutes(sessions: &[SleepSession]) -> i64 {
    sessions
        .iter()
        .map(|s| s.duration().num_minutes().max(0))
        .sum()
}

/// `"<hours>.<minutes>"` with unpadded minutes, so 7h05 renders as `"7.5"`.
///
/// This is the stored format the app and the prediction service have always
/// exchanged; it is not a decimal fraction of an hour.
pub fn format_sleep_duration(total_minutes: i64) -> String {
    format!("{}.{}", total_minutes / 60, total_minutes % 60)
}

/// One-decimal BPM text, rounded half up on the shortest decimal form of
/// `avg_bpm` (72.25 -> "72.3", 60.05 -> "60.1").
pub fn format_heart_rate(avg_bpm: f64) -> String {
    if !avg_bpm.is_finite() {
        return format!("{:.1}", avg_bpm);
    }

    let shortest = avg_bpm.abs().to_string();
    let (whole, frac) = shortest.split_once('.').unwrap_or((shortest.as_str(), ""));
    let mut frac_digits = frac.bytes();
    let tenths = frac_digits.next().unwrap_or(b'0');
    let round_up = frac_digits.next().is_some_and(|d| d >= b'5');

    let mut digits: Vec<u8> = whole.bytes().chain(std::iter::once(tenths)).collect();
    if round_up {
        increment_decimal(&mut digits);
    }

    let (whole, tenths) = digits.split_at(digits.len() - 1);
    let sign = if avg_bpm < 0.0 { "-" } else { "" };
    format!("{}{}.{}", sign, String::from_utf8_lossy(whole), tenths[0] as char)
}

/// Add one to a string of ASCII digits
fn increment_decimal(digits: &mut Vec<u8>) {
    for digit in digits.iter_mut().rev() {
        if *digit == b'9' {
            *digit = b'0';
        } else {
            *digit += 1;
            return;
        }
    }
    digits.insert(0, b'1');
}

/// Apply one snapshot to a copy of `current`.
///
/// Zero or empty readings keep the stored value, and fields in `guard` are
/// never overwritten. Fields a fetch does not produce pass through unchanged.
pub fn merge_snapshot(current: &UserProfile, snapshot: &FetchSnapshot, guard: &EditGuard) -> UserProfile {
    let mut merged = current.clone();

    if snapshot.step_count > 0 && !guard.is_editing(ProfileField::DailySteps) {
        merged.daily_steps = snapshot.step_count.to_string();
    }

    if snapshot.average_heart_rate > 0.0 && !guard.is_editing(ProfileField::HeartRate) {
        merged.heart_rate = format_heart_rate(snapshot.average_heart_rate);
    }

    if !snapshot.sleep_sessions.is_empty() && !guard.is_editing(ProfileField::SleepDuration) {
        merged.sleep_duration = format_sleep_duration(total_sleep_minutes(&snapshot.sleep_sessions));
    }

    merged
}

type WindowSource = Arc<dyn Fn() -> TimeWindow + Send + Sync>;

/// One reconciliation session: owns the edit guard and the sync status for
/// a single app session.
pub struct ReconciliationEngine {
    reader: HealthDataReader,
    store: Arc<PreferenceStore>,
    guard: Mutex<EditGuard>,
    status: watch::Sender<SyncStatus>,
    cycle: tokio::sync::Mutex<()>,
    window: WindowSource,
}

impl ReconciliationEngine {
    pub fn new(reader: HealthDataReader, store: Arc<PreferenceStore>) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            reader,
            store,
            guard: Mutex::new(EditGuard::new()),
            status,
            cycle: tokio::sync::Mutex::new(()),
            window: Arc::new(TimeWindow::today),
        }
    }

    /// Replace the query window source (defaults to "today so far")
    pub fn with_window_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> TimeWindow + Send + Sync + 'static,
    {
        self.window = Arc::new(source);
        self
    }

    pub fn store(&self) -> &Arc<PreferenceStore> {
        &self.store
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn observe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn edit_guard(&self) -> EditGuard {
        self.lock_guard().clone()
    }

    /// True while any health-derived field is being edited by hand
    pub fn is_manually_editing(&self) -> bool {
        !self.lock_guard().is_empty()
    }

    /// App-start entry point: sync right away when access is already
    /// granted, otherwise report that the host must prompt.
    pub async fn start(&self) -> Result<StartOutcome, SyncError> {
        match self.reader.is_authorized().await {
            Ok(true) => self.sync(SyncTrigger::Startup).await.map(StartOutcome::Synced),
            Ok(false) => {
                tracing::info!("Health data access not granted yet");
                Ok(StartOutcome::NeedsAuthorization)
            }
            Err(e) => {
                tracing::warn!("Health data provider unavailable: {}", e);
                self.publish(|s| s.error = Some(e.user_message()));
                Err(e)
            }
        }
    }

    /// Prompt for access and, if granted, run a user-requested sync.
    ///
    /// On denial the previous profile is kept and the status carries the
    /// denial message.
    pub async fn authorize_and_sync(&self) -> Result<UserProfile, SyncError> {
        let granted = match self.reader.request_authorization().await {
            Ok(granted) => granted,
            Err(e) => {
                self.publish(|s| s.error = Some(e.user_message()));
                return Err(e);
            }
        };
        if !granted {
            tracing::warn!("Health data permission denied");
            let err = SyncError::AuthorizationDenied;
            self.publish(|s| s.error = Some(err.user_message()));
            return Err(err);
        }
        self.sync(SyncTrigger::UserRequested).await
    }

    /// Run one fetch cycle and persist the merged profile.
    ///
    /// A second call while a cycle is running is rejected with
    /// [`SyncError::SyncInProgress`] and leaves the status untouched.
    pub async fn sync(&self, trigger: SyncTrigger) -> Result<UserProfile, SyncError> {
        let _cycle = self.cycle.try_lock().map_err(|_| {
            tracing::debug!("Rejected {:?} sync while another is running", trigger);
            SyncError::SyncInProgress
        })?;

        let cycle_id = Uuid::new_v4();
        let span = tracing::info_span!("sync_cycle", %cycle_id, ?trigger);

        async {
            self.publish(|s| {
                s.phase = SyncPhase::Fetching;
                s.is_fetching = true;
            });

            match self.run_cycle(trigger).await {
                Ok(profile) => {
                    self.publish(|s| {
                        s.phase = SyncPhase::Idle;
                        s.is_fetching = false;
                        s.error = None;
                        s.last_synced_at = Some(Utc::now());
                    });
                    tracing::info!("Sync complete");
                    Ok(profile)
                }
                Err(e) => {
                    tracing::error!("Error fetching data: {}", e);
                    self.publish(|s| {
                        s.phase = SyncPhase::Failed;
                        s.error = Some(e.user_message());
                    });
                    self.publish(|s| {
                        s.phase = SyncPhase::Idle;
                        s.is_fetching = false;
                    });
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_cycle(&self, trigger: SyncTrigger) -> Result<UserProfile, SyncError> {
        if !self.reader.is_authorized().await? {
            return Err(SyncError::AuthorizationDenied);
        }

        let window = (self.window)();
        let snapshot = self.reader.read_snapshot(&window).await?;
        tracing::debug!(
            steps = snapshot.step_count,
            sleep_sessions = snapshot.sleep_sessions.len(),
            heart_rate = snapshot.average_heart_rate,
            "Fetched snapshot"
        );

        if snapshot.is_empty() {
            tracing::debug!("Snapshot has no readings, keeping stored values");
        }

        self.publish(|s| s.phase = SyncPhase::Merging);

        // Merge against the latest persisted record under the store's write
        // lock so an edit saved during the fetch is not lost. Edits mark the
        // guard under this lock and a user sync releases it under it.
        let mut released = EditGuard::new();
        let result = self
            .store
            .update(|profile| {
                let mut guard = self.lock_guard();
                if !guard.is_empty() {
                    tracing::debug!(?trigger, "Keeping manually edited fields: {:?}", guard.fields().collect::<Vec<_>>());
                }
                *profile = merge_snapshot(profile, &snapshot, &guard);
                if trigger == SyncTrigger::UserRequested {
                    released = std::mem::take(&mut *guard);
                }
            })
            .await;

        if result.is_err() {
            let mut guard = self.lock_guard();
            for field in released.fields() {
                guard.mark(field);
            }
        }
        result
    }

    /// Persist a user edit of one field.
    ///
    /// Editing a health-derived field protects it from automatic merges
    /// until the next user-requested sync completes.
    pub async fn apply_edit(&self, field: ProfileField, value: impl Into<String>) -> Result<UserProfile, SyncError> {
        let value = value.into();
        if !field.is_valid_choice(&value) {
            return Err(SyncError::InvalidChoice { field, value });
        }

        self.store
            .update(|profile| {
                if field.is_health_derived() {
                    self.lock_guard().mark(field);
                }
                profile.set(field, value);
            })
            .await
    }

    fn lock_guard(&self) -> std::sync::MutexGuard<'_, EditGuard> {
        // The guard holds plain data; a poisoned lock still has a usable value.
        self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish<F: FnOnce(&mut SyncStatus)>(&self, change: F) {
        self.status.send_modify(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::mock::MockProvider;
    use crate::store::{Entries, KeyValueBackend, MemoryBackend};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Memory backend whose writes can be switched off
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: AtomicBool,
    }

    impl KeyValueBackend for FlakyBackend {
        fn read_all(&self) -> Result<Entries, SyncError> {
            self.inner.read_all()
        }

        fn write_all(&self, entries: &Entries) -> Result<(), SyncError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SyncError::Storage("disk full".to_string()));
            }
            self.inner.write_all(entries)
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, 0).unwrap()
    }

    fn fixed_window() -> TimeWindow {
        TimeWindow::new(at(0, 0), at(18, 0))
    }

    fn seeded_profile() -> UserProfile {
        UserProfile {
            name: "Budi".to_string(),
            gender: "Male".to_string(),
            age: "33".to_string(),
            sleep_duration: "7.30".to_string(),
            sleep_quality: "8".to_string(),
            heart_rate: "70.0".to_string(),
            daily_steps: "5000".to_string(),
            bmi_category: "Normal".to_string(),
            sleep_disorder: "Nothing".to_string(),
            ..UserProfile::default()
        }
    }

    async fn engine_with(provider: MockProvider, profile: UserProfile) -> (ReconciliationEngine, Arc<MockProvider>) {
        let provider = Arc::new(provider);
        let store = Arc::new(PreferenceStore::in_memory());
        store.save_profile(&profile).await.unwrap();
        let engine = ReconciliationEngine::new(HealthDataReader::new(provider.clone()), store)
            .with_window_source(fixed_window);
        (engine, provider)
    }

    #[test]
    fn test_sleep_format() {
        assert_eq!(format_sleep_duration(360), "6.0");
        assert_eq!(format_sleep_duration(425), "7.5");
        assert_eq!(format_sleep_duration(450), "7.30");
        assert_eq!(format_sleep_duration(59), "0.59");
    }

    #[test]
    fn test_heart_rate_rounds_half_up() {
        assert_eq!(format_heart_rate(72.25), "72.3");
        assert_eq!(format_heart_rate(72.75), "72.8");
        assert_eq!(format_heart_rate(60.05), "60.1");
        assert_eq!(format_heart_rate(80.15), "80.2");
        assert_eq!(format_heart_rate(72.4), "72.4");
        assert_eq!(format_heart_rate(88.0), "88.0");
        assert_eq!(format_heart_rate(61.26), "61.3");
        assert_eq!(format_heart_rate(99.96), "100.0");
        assert_eq!(format_heart_rate(0.04), "0.0");

        let snapshot = FetchSnapshot {
            average_heart_rate: 72.25,
            ..FetchSnapshot::default()
        };
        let merged = merge_snapshot(&seeded_profile(), &snapshot, &EditGuard::new());
        assert_eq!(merged.heart_rate, "72.3");
    }

    #[test]
    fn test_total_minutes_truncates_per_session() {
        let sessions = vec![
            SleepSession::new(at(1, 0), Utc.with_ymd_and_hms(2024, 1, 15, 2, 0, 59).unwrap()),
            SleepSession::new(at(3, 0), Utc.with_ymd_and_hms(2024, 1, 15, 3, 30, 59).unwrap()),
        ];
        assert_eq!(total_sleep_minutes(&sessions), 90);
    }

    #[test]
    fn test_merge_scenario() {
        let snapshot = FetchSnapshot {
            step_count: 8342,
            sleep_sessions: vec![SleepSession::new(at(8, 0), at(14, 0))],
            average_heart_rate: 72.4,
        };
        let merged = merge_snapshot(&seeded_profile(), &snapshot, &EditGuard::new());
        assert_eq!(merged.daily_steps, "8342");
        assert_eq!(merged.sleep_duration, "6.0");
        assert_eq!(merged.heart_rate, "72.4");
        assert_eq!(merged.name, "Budi");
        assert_eq!(merged.sleep_quality, "8");
    }

    #[test]
    fn test_zero_readings_keep_existing_values() {
        let merged = merge_snapshot(&seeded_profile(), &FetchSnapshot::default(), &EditGuard::new());
        assert_eq!(merged, seeded_profile());

        let steps_only = FetchSnapshot {
            step_count: 12,
            ..FetchSnapshot::default()
        };
        let merged = merge_snapshot(&seeded_profile(), &steps_only, &EditGuard::new());
        assert_eq!(merged.daily_steps, "12");
        assert_eq!(merged.heart_rate, "70.0");
        assert_eq!(merged.sleep_duration, "7.30");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let snapshot = FetchSnapshot {
            step_count: 900,
            sleep_sessions: vec![SleepSession::new(at(0, 10), at(6, 55))],
            average_heart_rate: 61.26,
        };
        let once = merge_snapshot(&seeded_profile(), &snapshot, &EditGuard::new());
        let twice = merge_snapshot(&once, &snapshot, &EditGuard::new());
        assert_eq!(once, twice);
        assert_eq!(once.heart_rate, "61.3");
        assert_eq!(once.sleep_duration, "6.45");
    }

    #[test]
    fn test_guard_is_per_field() {
        let snapshot = FetchSnapshot {
            step_count: 10_000,
            sleep_sessions: vec![SleepSession::new(at(0, 0), at(8, 0))],
            average_heart_rate: 80.0,
        };
        let guard: EditGuard = [ProfileField::HeartRate, ProfileField::Name].into_iter().collect();
        let merged = merge_snapshot(&seeded_profile(), &snapshot, &guard);
        assert_eq!(merged.heart_rate, "70.0");
        assert_eq!(merged.daily_steps, "10000");
        assert_eq!(merged.sleep_duration, "8.0");
        // Non-health fields are never tracked
        assert!(!guard.is_editing(ProfileField::Name));
    }

    #[tokio::test]
    async fn test_sync_persists_merge() {
        let provider = MockProvider::granted()
            .with_steps(&[8000, 342])
            .with_sleep_hours(&[(8, 14)])
            .with_heart_rate(Some(72.4));
        let (engine, _) = engine_with(provider, seeded_profile()).await;
        let mut stream = engine.store().observe_profile();
        stream.next().await.unwrap();

        let profile = engine.sync(SyncTrigger::Startup).await.unwrap();
        assert_eq!(profile.daily_steps, "8342");
        assert_eq!(profile.sleep_duration, "6.0");
        assert_eq!(profile.heart_rate, "72.4");
        assert_eq!(stream.next().await.unwrap(), profile);

        let status = engine.status();
        assert_eq!(status.phase, SyncPhase::Idle);
        assert!(!status.is_fetching);
        assert!(status.error.is_none());
        assert!(status.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_profile() {
        let (engine, _) = engine_with(MockProvider::granted().failing_reads(), seeded_profile()).await;

        let result = engine.sync(SyncTrigger::UserRequested).await;
        assert!(result.is_err());
        assert_eq!(engine.store().load_profile(), seeded_profile());

        let status = engine.status();
        assert!(!status.is_fetching);
        assert_eq!(status.phase, SyncPhase::Idle);
        assert!(status.error.unwrap().starts_with("Failed to fetch data"));
    }

    #[tokio::test]
    async fn test_unavailable_provider_on_start() {
        let (engine, _) = engine_with(MockProvider::granted().failing_permissions(), seeded_profile()).await;
        assert!(engine.start().await.is_err());
        assert_eq!(engine.store().load_profile(), seeded_profile());
        assert!(engine.status().error.is_some());
    }

    #[tokio::test]
    async fn test_manual_edit_survives_startup_sync() {
        let provider = MockProvider::granted().with_steps(&[9000]).with_heart_rate(Some(88.0));
        let (engine, provider) = engine_with(provider, seeded_profile()).await;

        engine.apply_edit(ProfileField::DailySteps, "12345").await.unwrap();
        assert!(engine.is_manually_editing());

        let profile = engine.sync(SyncTrigger::Startup).await.unwrap();
        assert_eq!(profile.daily_steps, "12345");
        assert_eq!(profile.heart_rate, "88.0");

        // New readings still cannot overwrite the edited field
        provider.set_steps(&[20_000]);
        provider.set_heart_rate(Some(90.0));
        let profile = engine.sync(SyncTrigger::Startup).await.unwrap();
        assert_eq!(profile.daily_steps, "12345");
        assert_eq!(profile.heart_rate, "90.0");
        assert!(engine.is_manually_editing());
    }

    #[tokio::test]
    async fn test_user_sync_completion_resets_guard() {
        let provider = MockProvider::granted().with_steps(&[9000]);
        let (engine, provider) = engine_with(provider, seeded_profile()).await;

        engine.apply_edit(ProfileField::DailySteps, "1").await.unwrap();
        let profile = engine.sync(SyncTrigger::UserRequested).await.unwrap();
        assert_eq!(profile.daily_steps, "1");
        assert!(!engine.is_manually_editing());

        provider.set_steps(&[9100]);
        let profile = engine.sync(SyncTrigger::Startup).await.unwrap();
        assert_eq!(profile.daily_steps, "9100");
    }

    #[tokio::test]
    async fn test_failed_user_sync_keeps_guard() {
        let (engine, _) = engine_with(MockProvider::granted().failing_reads(), seeded_profile()).await;
        engine.apply_edit(ProfileField::SleepDuration, "8.0").await.unwrap();
        assert!(engine.sync(SyncTrigger::UserRequested).await.is_err());
        assert!(engine.edit_guard().is_editing(ProfileField::SleepDuration));
    }

    #[tokio::test]
    async fn test_edit_validation() {
        let (engine, _) = engine_with(MockProvider::granted(), seeded_profile()).await;
        let err = engine.apply_edit(ProfileField::Gender, "Robot").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidChoice { .. }));
        assert_eq!(engine.store().load_profile().gender, "Male");

        let saved = engine.apply_edit(ProfileField::Age, "34").await.unwrap();
        assert_eq!(saved.age, "34");
        assert!(!engine.is_manually_editing());
    }

    #[tokio::test]
    async fn test_denied_authorization() {
        let (engine, _) = engine_with(MockProvider::denied().with_steps(&[500]), seeded_profile()).await;

        assert_eq!(engine.start().await.unwrap(), StartOutcome::NeedsAuthorization);
        let err = engine.authorize_and_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::AuthorizationDenied));
        assert_eq!(engine.store().load_profile(), seeded_profile());
        assert_eq!(
            engine.status().error.as_deref(),
            Some("Permission denied. The app needs access to health data.")
        );
    }

    #[tokio::test]
    async fn test_authorization_prompt_then_sync() {
        let provider = MockProvider::denied().grant_on_request().with_steps(&[700]);
        let (engine, _) = engine_with(provider, seeded_profile()).await;
        let profile = engine.authorize_and_sync().await.unwrap();
        assert_eq!(profile.daily_steps, "700");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sync_rejected() {
        let provider = MockProvider::granted()
            .with_steps(&[100])
            .with_read_delay(Duration::from_secs(2));
        let (engine, provider) = engine_with(provider, seeded_profile()).await;

        let (first, second) = tokio::join!(engine.sync(SyncTrigger::Startup), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            engine.sync(SyncTrigger::UserRequested).await
        });

        assert_eq!(first.unwrap().daily_steps, "100");
        assert!(matches!(second, Err(SyncError::SyncInProgress)));
        assert_eq!(provider.step_reads.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_fetching_while_sync_runs() {
        let provider = MockProvider::granted()
            .with_steps(&[4321])
            .with_read_delay(Duration::from_secs(2));
        let (engine, _) = engine_with(provider, seeded_profile()).await;
        let mut status_rx = engine.observe_status();

        let (result, observed, midway) = tokio::join!(
            engine.sync(SyncTrigger::UserRequested),
            async {
                let mut observed = Vec::new();
                while status_rx.changed().await.is_ok() {
                    let status = status_rx.borrow_and_update().clone();
                    let done = status.phase == SyncPhase::Idle && !status.is_fetching;
                    observed.push(status);
                    if done {
                        break;
                    }
                }
                observed
            },
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                engine.status()
            }
        );

        assert_eq!(result.unwrap().daily_steps, "4321");
        assert_eq!(midway.phase, SyncPhase::Fetching);
        assert!(midway.is_fetching);
        assert!(observed
            .iter()
            .any(|s| s.phase == SyncPhase::Fetching && s.is_fetching));

        let last = observed.last().unwrap();
        assert_eq!(last.phase, SyncPhase::Idle);
        assert!(!last.is_fetching);
        assert!(last.error.is_none());
    }

    #[tokio::test]
    async fn test_failed_merge_write_keeps_guard() {
        let backend = Arc::new(FlakyBackend::default());
        let store = Arc::new(PreferenceStore::open(backend.clone()).unwrap());
        store.save_profile(&seeded_profile()).await.unwrap();
        let provider = MockProvider::granted().with_sleep_hours(&[(0, 6)]);
        let engine = ReconciliationEngine::new(HealthDataReader::new(Arc::new(provider)), store)
            .with_window_source(fixed_window);

        engine.apply_edit(ProfileField::SleepDuration, "8.0").await.unwrap();
        backend.failing.store(true, Ordering::SeqCst);

        assert!(engine.sync(SyncTrigger::UserRequested).await.is_err());
        assert!(engine.edit_guard().is_editing(ProfileField::SleepDuration));
        assert_eq!(engine.store().load_profile().sleep_duration, "8.0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_during_user_sync_then_after_it() {
        let provider = MockProvider::granted()
            .with_steps(&[9000])
            .with_read_delay(Duration::from_secs(2));
        let (engine, provider) = engine_with(provider, seeded_profile()).await;

        // An edit saved while the fetch is in flight wins over the merge
        let (synced, edited) = tokio::join!(engine.sync(SyncTrigger::UserRequested), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            engine.apply_edit(ProfileField::DailySteps, "4242").await
        });
        edited.unwrap();
        assert_eq!(synced.unwrap().daily_steps, "4242");
        assert!(!engine.is_manually_editing());

        // An edit after the user sync finished stays protected
        engine.apply_edit(ProfileField::DailySteps, "5151").await.unwrap();
        provider.set_steps(&[12_000]);
        let profile = engine.sync(SyncTrigger::Startup).await.unwrap();
        assert_eq!(profile.daily_steps, "5151");
        assert!(engine.edit_guard().is_editing(ProfileField::DailySteps));
    }
}
