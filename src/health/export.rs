//! JSON export provider
//!
//! Reads a Health-Connect-style export (the shape the companion app dumps for
//! debugging) and answers provider queries from it, filtering each record
//! kind to the requested window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use super::{HealthDataProvider, HeartRateAggregate, RecordType, StepRecord, TimeWindow};
use crate::error::SyncError;
use crate::types::SleepSession;

/// Provider backed by an in-memory export document
#[derive(Debug, Clone)]
pub struct JsonExportProvider {
    granted: HashSet<RecordType>,
    steps: Vec<StepRecord>,
    sleep: Vec<SleepSession>,
    heart_rate: Vec<HeartRateSample>,
}

#[derive(Debug, Clone, Copy)]
struct HeartRateSample {
    time: DateTime<Utc>,
    bpm: f64,
}

impl JsonExportProvider {
    pub fn from_json(raw_json: &str) -> Result<Self, SyncError> {
        let export: ExportPayload = serde_json::from_str(raw_json)?;

        let granted = match export.granted_permissions {
            Some(list) => list.into_iter().collect(),
            // Older exports predate the permission list and were only
            // produced with full access.
            None => RecordType::REQUIRED.iter().copied().collect(),
        };

        let mut steps = Vec::with_capacity(export.steps.len());
        for record in export.steps {
            if record.end_time < record.start_time {
                return Err(SyncError::ProviderUnavailable(format!(
                    "step record ends before it starts ({})",
                    record.start_time
                )));
            }
            steps.push(StepRecord {
                start: record.start_time,
                end: record.end_time,
                count: record.count,
            });
        }

        let mut sleep = Vec::with_capacity(export.sleep_sessions.len());
        for session in export.sleep_sessions {
            if session.end_time < session.start_time {
                return Err(SyncError::ProviderUnavailable(format!(
                    "sleep session ends before it starts ({})",
                    session.start_time
                )));
            }
            sleep.push(SleepSession::new(session.start_time, session.end_time));
        }

        let heart_rate = export
            .heart_rate
            .into_iter()
            .flat_map(|record| record.samples)
            .map(|s| HeartRateSample {
                time: s.time,
                bpm: s.beats_per_minute,
            })
            .collect();

        Ok(Self {
            granted,
            steps,
            sleep,
            heart_rate,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, SyncError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

#[async_trait]
impl HealthDataProvider for JsonExportProvider {
    async fn granted_permissions(&self) -> Result<HashSet<RecordType>, SyncError> {
        Ok(self.granted.clone())
    }

    /// An export cannot gain permissions after the fact
    async fn request_permissions(
        &self,
        _wanted: &[RecordType],
    ) -> Result<HashSet<RecordType>, SyncError> {
        Ok(self.granted.clone())
    }

    async fn read_step_records(&self, window: &TimeWindow) -> Result<Vec<StepRecord>, SyncError> {
        Ok(self
            .steps
            .iter()
            .filter(|r| window.contains(r.start))
            .copied()
            .collect())
    }

    async fn read_sleep_sessions(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<SleepSession>, SyncError> {
        Ok(self
            .sleep
            .iter()
            .filter(|s| window.overlaps(s.start, s.end))
            .copied()
            .collect())
    }

    async fn aggregate_heart_rate(
        &self,
        window: &TimeWindow,
    ) -> Result<HeartRateAggregate, SyncError> {
        let bpms: Vec<f64> = self
            .heart_rate
            .iter()
            .filter(|s| window.contains(s.time))
            .map(|s| s.bpm)
            .collect();

        if bpms.is_empty() {
            return Ok(HeartRateAggregate::default());
        }

        let sum: f64 = bpms.iter().sum();
        Ok(HeartRateAggregate {
            avg_bpm: Some(sum / bpms.len() as f64),
            min_bpm: bpms.iter().copied().reduce(f64::min),
            max_bpm: bpms.iter().copied().reduce(f64::max),
        })
    }
}

// Export document structures

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportPayload {
    granted_permissions: Option<Vec<RecordType>>,
    #[serde(default)]
    steps: Vec<ExportSteps>,
    #[serde(default)]
    sleep_sessions: Vec<ExportSleep>,
    #[serde(default)]
    heart_rate: Vec<ExportHeartRate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportSteps {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportSleep {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportHeartRate {
    #[serde(default)]
    samples: Vec<ExportHeartRateSample>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportHeartRateSample {
    time: DateTime<Utc>,
    beats_per_minute: f64,
}
