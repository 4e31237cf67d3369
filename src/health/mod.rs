//! Health data reading
//!
//! A [`HealthDataProvider`] is the platform boundary (Health Connect on the
//! device, a JSON export in the CLI). [`HealthDataReader`] wraps a provider
//! with the authorization precondition, a per-query timeout and degradation
//! to safe defaults, so callers never see a provider error for a single
//! metric.

mod export;
#[cfg(test)]
pub(crate) mod mock;

pub use export::JsonExportProvider;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DEFAULT_FETCH_TIMEOUT_SECS;
use crate::error::SyncError;
use crate::types::{FetchSnapshot, SleepSession};

/// Record kinds the app needs read access to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Steps,
    SleepSession,
    HeartRate,
}

impl RecordType {
    /// Every record type a fetch cycle reads
    pub const REQUIRED: [RecordType; 3] =
        [RecordType::Steps, RecordType::SleepSession, RecordType::HeartRate];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Steps => "steps",
            RecordType::SleepSession => "sleep_session",
            RecordType::HeartRate => "heart_rate",
        }
    }
}

/// Instant range a query covers, `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Local calendar day start through now
    pub fn today() -> Self {
        Self::day_to_date(Utc::now(), &Local)
    }

    /// Start of `now`'s calendar day in `tz` through `now`.
    ///
    /// Falls back to a zero-length window at `now` when local midnight does
    /// not exist (DST transition at midnight).
    pub fn day_to_date<Tz: TimeZone>(now: DateTime<Utc>, tz: &Tz) -> Self {
        let local = now.with_timezone(tz);
        let start = local
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| tz.from_local_datetime(&midnight).earliest())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now);
        Self { start, end: now }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start <= self.end && end >= self.start
    }
}

/// A step count record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: u64,
}

/// Heart-rate statistics over a window; `None` when there are no samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartRateAggregate {
    pub avg_bpm: Option<f64>,
    pub min_bpm: Option<f64>,
    pub max_bpm: Option<f64>,
}

/// Platform health data boundary
#[async_trait]
pub trait HealthDataProvider: Send + Sync {
    /// Record types the user has granted read access to
    async fn granted_permissions(&self) -> Result<HashSet<RecordType>, SyncError>;

    /// Prompt for access; returns the resulting granted set
    async fn request_permissions(
        &self,
        wanted: &[RecordType],
    ) -> Result<HashSet<RecordType>, SyncError>;

    async fn read_step_records(&self, window: &TimeWindow) -> Result<Vec<StepRecord>, SyncError>;

    async fn read_sleep_sessions(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<SleepSession>, SyncError>;

    async fn aggregate_heart_rate(
        &self,
        window: &TimeWindow,
    ) -> Result<HeartRateAggregate, SyncError>;
}

/// True when `granted` covers every required record type
pub fn has_required_permissions(granted: &HashSet<RecordType>) -> bool {
    RecordType::REQUIRED.iter().all(|r| granted.contains(r))
}

/// Timeout-bounded, failure-tolerant reader over a provider
#[derive(Clone)]
pub struct HealthDataReader {
    provider: Arc<dyn HealthDataProvider>,
    timeout: Duration,
}

impl HealthDataReader {
    pub fn new(provider: Arc<dyn HealthDataProvider>) -> Self {
        Self::with_timeout(provider, Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS))
    }

    pub fn with_timeout(provider: Arc<dyn HealthDataProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// Whether all required record types are readable.
    ///
    /// Unlike the metric reads this propagates provider errors: a provider
    /// that cannot even report its permissions is unavailable.
    pub async fn is_authorized(&self) -> Result<bool, SyncError> {
        let granted = self.bounded(self.provider.granted_permissions()).await?;
        Ok(has_required_permissions(&granted))
    }

    /// Ask the provider for access and report whether it was fully granted
    pub async fn request_authorization(&self) -> Result<bool, SyncError> {
        let granted = self
            .provider
            .request_permissions(&RecordType::REQUIRED)
            .await?;
        Ok(has_required_permissions(&granted))
    }

    /// Sum of step counts in the window, 0 on any failure
    pub async fn read_steps(&self, window: &TimeWindow) -> u64 {
        degrade("steps", self.fetch_steps(window).await, 0)
    }

    /// Sleep sessions in the window, empty on any failure
    pub async fn read_sleep_sessions(&self, window: &TimeWindow) -> Vec<SleepSession> {
        degrade("sleep", self.fetch_sleep_sessions(window).await, Vec::new())
    }

    /// Window-average BPM, 0.0 when there are no samples or on any failure
    pub async fn read_average_heart_rate(&self, window: &TimeWindow) -> f64 {
        degrade("heart rate", self.fetch_average_heart_rate(window).await, 0.0)
    }

    /// Issue the three reads concurrently and wait for all of them.
    ///
    /// Individual failures degrade to their defaults. Only when every read
    /// fails is the cycle reported as failed, with the first error.
    pub async fn read_snapshot(&self, window: &TimeWindow) -> Result<FetchSnapshot, SyncError> {
        let (steps, sleep, heart_rate) = tokio::join!(
            self.fetch_steps(window),
            self.fetch_sleep_sessions(window),
            self.fetch_average_heart_rate(window),
        );

        let (steps, sleep, heart_rate) = match (steps, sleep, heart_rate) {
            (Err(err), Err(_), Err(_)) => {
                tracing::warn!("All health data reads failed: {}", err);
                return Err(err);
            }
            results => results,
        };

        Ok(FetchSnapshot {
            step_count: degrade("steps", steps, 0),
            sleep_sessions: degrade("sleep", sleep, Vec::new()),
            average_heart_rate: degrade("heart rate", heart_rate, 0.0),
        })
    }

    async fn fetch_steps(&self, window: &TimeWindow) -> Result<u64, SyncError> {
        self.authorized_query(RecordType::Steps, async {
            tracing::debug!("Fetching steps between {} and {}", window.start, window.end);
            let records = self.provider.read_step_records(window).await?;
            let steps: u64 = records.iter().map(|r| r.count).sum();
            tracing::debug!("Fetched steps: {}", steps);
            Ok(steps)
        })
        .await
    }

    async fn fetch_sleep_sessions(&self, window: &TimeWindow) -> Result<Vec<SleepSession>, SyncError> {
        self.authorized_query(RecordType::SleepSession, async {
            tracing::debug!("Fetching sleep between {} and {}", window.start, window.end);
            let sessions = self.provider.read_sleep_sessions(window).await?;
            tracing::debug!("Fetched {} sleep records", sessions.len());
            Ok(sessions)
        })
        .await
    }

    async fn fetch_average_heart_rate(&self, window: &TimeWindow) -> Result<f64, SyncError> {
        self.authorized_query(RecordType::HeartRate, async {
            tracing::debug!("Fetching heart rate between {} and {}", window.start, window.end);
            let aggregate = self.provider.aggregate_heart_rate(window).await?;
            match aggregate.avg_bpm {
                Some(avg) => {
                    tracing::debug!("Average BPM: {}", avg);
                    Ok(avg.max(0.0))
                }
                None => {
                    tracing::debug!("No heart rate samples in window");
                    Ok(0.0)
                }
            }
        })
        .await
    }

    /// Run `query` if `record` is readable, all within the fetch timeout
    async fn authorized_query<T, F>(&self, record: RecordType, query: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>> + Send,
    {
        self.bounded(async {
            let granted = self.provider.granted_permissions().await?;
            if !granted.contains(&record) {
                return Err(SyncError::AuthorizationDenied);
            }
            query.await
        })
        .await
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.timeout.as_secs())),
        }
    }
}

fn degrade<T>(metric: &str, result: Result<T, SyncError>, default: T) -> T {
    match result {
        Ok(value) => value,
        Err(SyncError::Timeout(secs)) => {
            tracing::warn!("Timeout after {}s while reading {}", secs, metric);
            default
        }
        Err(e) => {
            tracing::warn!("Error reading {}: {}", metric, e);
            default
        }
    }
}
