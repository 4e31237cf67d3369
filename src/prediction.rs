//! Remote stress prediction
//!
//! Converts the text profile into the typed request the prediction service
//! expects and submits it. Conversion happens entirely before any network
//! activity, so a profile that fails validation never produces a request.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::types::{ProfileField, UserProfile};

/// Fields that must be filled in before a prediction can be requested
pub const REQUIRED_FIELDS: [ProfileField; 8] = [
    ProfileField::Gender,
    ProfileField::Age,
    ProfileField::SleepDuration,
    ProfileField::SleepQuality,
    ProfileField::BmiCategory,
    ProfileField::HeartRate,
    ProfileField::DailySteps,
    ProfileField::SleepDisorder,
];

/// Body of `POST /predict`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressPredictionRequest {
    #[serde(rename = "Gender")]
    pub gender: String,
    #[serde(rename = "Age")]
    pub age: i32,
    #[serde(rename = "Sleep_Duration")]
    pub sleep_duration: f64,
    #[serde(rename = "Quality_of_Sleep")]
    pub quality_of_sleep: i32,
    #[serde(rename = "BMI_Category")]
    pub bmi_category: String,
    #[serde(rename = "Heart_Rate")]
    pub heart_rate: i32,
    #[serde(rename = "Daily_Steps")]
    pub daily_steps: i32,
    #[serde(rename = "Sleep_Disorder")]
    pub sleep_disorder: String,
}

impl StressPredictionRequest {
    /// Validate and convert a profile.
    ///
    /// Heart rate is stored with one decimal and is rounded to whole BPM.
    /// The legacy "Normal Weight" BMI label is sent as "Normal".
    pub fn from_profile(profile: &UserProfile) -> Result<Self, SyncError> {
        if let Some(missing) = REQUIRED_FIELDS
            .iter()
            .copied()
            .find(|f| profile.get(*f).trim().is_empty())
        {
            return Err(SyncError::MissingField(missing));
        }

        let bmi_category = match profile.bmi_category.trim() {
            "Normal Weight" => "Normal".to_string(),
            other => other.to_string(),
        };

        Ok(Self {
            gender: profile.gender.trim().to_string(),
            age: parse_int(profile, ProfileField::Age)?,
            sleep_duration: parse_float(profile, ProfileField::SleepDuration)?,
            quality_of_sleep: parse_int(profile, ProfileField::SleepQuality)?,
            bmi_category,
            heart_rate: parse_float(profile, ProfileField::HeartRate)?.round() as i32,
            daily_steps: parse_int(profile, ProfileField::DailySteps)?,
            sleep_disorder: profile.sleep_disorder.trim().to_string(),
        })
    }
}

fn parse_int(profile: &UserProfile, field: ProfileField) -> Result<i32, SyncError> {
    profile
        .get(field)
        .trim()
        .parse::<i32>()
        .map_err(|_| SyncError::InvalidNumber(field))
}

fn parse_float(profile: &UserProfile, field: ProfileField) -> Result<f64, SyncError> {
    let value = profile
        .get(field)
        .trim()
        .parse::<f64>()
        .map_err(|_| SyncError::InvalidNumber(field))?;
    if value.is_finite() && value <= i32::MAX as f64 {
        Ok(value)
    } else {
        Err(SyncError::InvalidNumber(field))
    }
}

/// Response of `POST /predict`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressPredictionResponse {
    pub predicted_stress_level: String,
}

/// Remote prediction boundary
#[async_trait]
pub trait PredictionClient: Send + Sync {
    async fn predict(
        &self,
        request: &StressPredictionRequest,
    ) -> Result<StressPredictionResponse, SyncError>;
}

/// reqwest-backed client for the prediction service
#[derive(Clone)]
pub struct HttpPredictionClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpPredictionClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.prediction_base_url.clone(), config.prediction_timeout())
    }

    pub fn endpoint(&self) -> String {
        format!("{}/predict", self.base_url)
    }
}

#[async_trait]
impl PredictionClient for HttpPredictionClient {
    async fn predict(
        &self,
        request: &StressPredictionRequest,
    ) -> Result<StressPredictionResponse, SyncError> {
        let response = self
            .client
            .post(self.endpoint())
            .json(request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Prediction network error: {}", e);
                SyncError::PredictionTransport(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!("Prediction failed with {}: {}", status, body);
            return Err(SyncError::PredictionStatus {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }

        Ok(response.json::<StressPredictionResponse>().await?)
    }
}

/// Validate `profile` and, only if it converts cleanly, request a prediction
pub async fn submit_prediction(
    client: &dyn PredictionClient,
    profile: &UserProfile,
) -> Result<StressPredictionResponse, SyncError> {
    let request = StressPredictionRequest::from_profile(profile).map_err(|e| {
        tracing::warn!("Prediction input rejected: {}", e);
        e
    })?;
    let response = client.predict(&request).await?;
    tracing::info!("Predicted stress level: {}", response.predicted_stress_level);
    Ok(response)
}
