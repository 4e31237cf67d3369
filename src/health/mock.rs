//! Scripted provider for unit tests

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{HealthDataProvider, HeartRateAggregate, RecordType, StepRecord, TimeWindow};
use crate::error::SyncError;
use crate::types::SleepSession;

pub(crate) struct MockProvider {
    granted: Mutex<HashSet<RecordType>>,
    grant_on_request: bool,
    permissions_fail: bool,
    steps: Mutex<Vec<u64>>,
    sleep: Mutex<Vec<SleepSession>>,
    heart_rate: Mutex<Option<f64>>,
    steps_delay: Option<Duration>,
    all_delay: Option<Duration>,
    fail_reads: bool,
    fail_sleep: AtomicBool,
    pub(crate) step_reads: AtomicUsize,
}

impl MockProvider {
    pub(crate) fn granted() -> Self {
        Self::with_granted(RecordType::REQUIRED.iter().copied().collect())
    }

    pub(crate) fn denied() -> Self {
        Self::with_granted(HashSet::new())
    }

    fn with_granted(granted: HashSet<RecordType>) -> Self {
        Self {
            granted: Mutex::new(granted),
            grant_on_request: false,
            permissions_fail: false,
            steps: Mutex::new(Vec::new()),
            sleep: Mutex::new(Vec::new()),
            heart_rate: Mutex::new(None),
            steps_delay: None,
            all_delay: None,
            fail_reads: false,
            fail_sleep: AtomicBool::new(false),
            step_reads: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_steps(self, counts: &[u64]) -> Self {
        *self.steps.lock().unwrap() = counts.to_vec();
        self
    }

    /// Sessions given as (start hour, end hour) on 2024-01-15 UTC
    pub(crate) fn with_sleep_hours(self, spans: &[(u32, u32)]) -> Self {
        *self.sleep.lock().unwrap() = spans
            .iter()
            .map(|(s, e)| {
                SleepSession::new(
                    Utc.with_ymd_and_hms(2024, 1, 15, *s, 0, 0).unwrap(),
                    Utc.with_ymd_and_hms(2024, 1, 15, *e, 0, 0).unwrap(),
                )
            })
            .collect();
        self
    }

    pub(crate) fn with_heart_rate(self, avg: Option<f64>) -> Self {
        *self.heart_rate.lock().unwrap() = avg;
        self
    }

    pub(crate) fn with_steps_delay(mut self, delay: Duration) -> Self {
        self.steps_delay = Some(delay);
        self
    }

    pub(crate) fn with_read_delay(mut self, delay: Duration) -> Self {
        self.all_delay = Some(delay);
        self
    }

    pub(crate) fn grant_on_request(mut self) -> Self {
        self.grant_on_request = true;
        self
    }

    pub(crate) fn failing_permissions(mut self) -> Self {
        self.permissions_fail = true;
        self
    }

    pub(crate) fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    pub(crate) fn failing_sleep(self) -> Self {
        self.fail_sleep.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn set_steps(&self, counts: &[u64]) {
        *self.steps.lock().unwrap() = counts.to_vec();
    }

    pub(crate) fn set_heart_rate(&self, avg: Option<f64>) {
        *self.heart_rate.lock().unwrap() = avg;
    }

    async fn pause(&self) {
        if let Some(delay) = self.all_delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn read_error(&self) -> Result<(), SyncError> {
        if self.fail_reads {
            Err(SyncError::ProviderUnavailable("mock provider offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl HealthDataProvider for MockProvider {
    async fn granted_permissions(&self) -> Result<HashSet<RecordType>, SyncError> {
        if self.permissions_fail {
            return Err(SyncError::ProviderUnavailable("health service missing".to_string()));
        }
        Ok(self.granted.lock().unwrap().clone())
    }

    async fn request_permissions(
        &self,
        wanted: &[RecordType],
    ) -> Result<HashSet<RecordType>, SyncError> {
        let mut granted = self.granted.lock().unwrap();
        if self.grant_on_request {
            granted.extend(wanted.iter().copied());
        }
        Ok(granted.clone())
    }

    async fn read_step_records(&self, window: &TimeWindow) -> Result<Vec<StepRecord>, SyncError> {
        self.step_reads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.steps_delay {
            tokio::time::sleep(delay).await;
        }
        self.pause().await;
        self.read_error()?;
        let counts = self.steps.lock().unwrap().clone();
        Ok(counts
            .into_iter()
            .map(|count| StepRecord {
                start: window.start,
                end: window.end,
                count,
            })
            .collect())
    }

    async fn read_sleep_sessions(
        &self,
        _window: &TimeWindow,
    ) -> Result<Vec<SleepSession>, SyncError> {
        self.pause().await;
        self.read_error()?;
        if self.fail_sleep.load(Ordering::SeqCst) {
            return Err(SyncError::ProviderUnavailable("sleep query rejected".to_string()));
        }
        Ok(self.sleep.lock().unwrap().clone())
    }

    async fn aggregate_heart_rate(
        &self,
        _window: &TimeWindow,
    ) -> Result<HeartRateAggregate, SyncError> {
        self.pause().await;
        self.read_error()?;
        let avg = *self.heart_rate.lock().unwrap();
        Ok(HeartRateAggregate {
            avg_bpm: avg,
            min_bpm: avg,
            max_bpm: avg,
        })
    }
}
