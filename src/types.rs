//! Core types for wellness-sync
//!
//! This module defines the persisted profile, the field catalogue used to
//! address individual entries, and the transient fetch snapshot that flows
//! from the health data reader into the reconciliation engine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Gender choices offered by the profile editor
pub const GENDER_OPTIONS: &[&str] = &["Male", "Female"];

/// BMI category choices offered by the profile editor
pub const BMI_CATEGORY_OPTIONS: &[&str] = &["Underweight", "Normal", "Overweight", "Obese"];

/// Sleep disorder choices offered by the profile editor
pub const SLEEP_DISORDER_OPTIONS: &[&str] = &["Nothing", "Insomnia", "Sleep Apnea"];

/// Addressable field of a [`UserProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileField {
    Name,
    Email,
    Gender,
    Age,
    Height,
    Weight,
    SleepDuration,
    SleepQuality,
    HeartRate,
    DailySteps,
    BmiCategory,
    SleepDisorder,
    SystolicBp,
    DiastolicBp,
}

impl ProfileField {
    pub const ALL: [ProfileField; 14] = [
        ProfileField::Name,
        ProfileField::Email,
        ProfileField::Gender,
        ProfileField::Age,
        ProfileField::Height,
        ProfileField::Weight,
        ProfileField::SleepDuration,
        ProfileField::SleepQuality,
        ProfileField::HeartRate,
        ProfileField::DailySteps,
        ProfileField::BmiCategory,
        ProfileField::SleepDisorder,
        ProfileField::SystolicBp,
        ProfileField::DiastolicBp,
    ];

    /// Key under which the field is persisted
    pub fn key(&self) -> &'static str {
        match self {
            ProfileField::Name => "name",
            ProfileField::Email => "email",
            ProfileField::Gender => "gender",
            ProfileField::Age => "age",
            ProfileField::Height => "height",
            ProfileField::Weight => "weight",
            ProfileField::SleepDuration => "sleep_duration",
            ProfileField::SleepQuality => "sleep_quality",
            ProfileField::HeartRate => "heart_rate",
            ProfileField::DailySteps => "daily_steps",
            ProfileField::BmiCategory => "bmi_category",
            ProfileField::SleepDisorder => "sleep_disorder",
            ProfileField::SystolicBp => "systolic_bp",
            ProfileField::DiastolicBp => "diastolic_bp",
        }
    }

    /// Fields whose value can be produced by a health data fetch
    pub fn is_health_derived(&self) -> bool {
        matches!(
            self,
            ProfileField::SleepDuration | ProfileField::HeartRate | ProfileField::DailySteps
        )
    }

    /// Allowed values for enum-like fields, `None` for free text
    pub fn choices(&self) -> Option<&'static [&'static str]> {
        match self {
            ProfileField::Gender => Some(GENDER_OPTIONS),
            ProfileField::BmiCategory => Some(BMI_CATEGORY_OPTIONS),
            ProfileField::SleepDisorder => Some(SLEEP_DISORDER_OPTIONS),
            _ => None,
        }
    }

    /// Empty always passes; free-text fields accept anything
    pub fn is_valid_choice(&self, value: &str) -> bool {
        value.is_empty() || self.choices().map_or(true, |choices| choices.contains(&value))
    }

    /// Value rendered when the persisted entry is empty.
    ///
    /// Never written back to the store.
    pub fn presentation_default(&self) -> &'static str {
        match self {
            ProfileField::Name => "User",
            ProfileField::Age => "18",
            ProfileField::Height => "167",
            ProfileField::Weight => "58",
            ProfileField::BmiCategory => "Normal",
            ProfileField::SleepDuration | ProfileField::HeartRate | ProfileField::DailySteps => "0",
            _ => "",
        }
    }
}

impl fmt::Display for ProfileField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ProfileField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ProfileField::ALL
            .iter()
            .copied()
            .find(|field| field.key() == normalized)
            .ok_or_else(|| format!("unknown profile field '{}'", s))
    }
}

/// The durable, flat record of user-entered and derived wellness fields.
///
/// Every value is text; an absent value is the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub name: String,
    pub email: String,
    pub gender: String,
    pub age: String,
    pub height: String,
    pub weight: String,
    /// `"<hours>.<minutes>"`, e.g. `"7.5"` for 7h05
    pub sleep_duration: String,
    /// 1-10
    pub sleep_quality: String,
    /// One-decimal BPM
    pub heart_rate: String,
    pub daily_steps: String,
    pub bmi_category: String,
    pub sleep_disorder: String,
    pub systolic_bp: String,
    pub diastolic_bp: String,
}

impl UserProfile {
    pub fn get(&self, field: ProfileField) -> &str {
        match field {
            ProfileField::Name => &self.name,
            ProfileField::Email => &self.email,
            ProfileField::Gender => &self.gender,
            ProfileField::Age => &self.age,
            ProfileField::Height => &self.height,
            ProfileField::Weight => &self.weight,
            ProfileField::SleepDuration => &self.sleep_duration,
            ProfileField::SleepQuality => &self.sleep_quality,
            ProfileField::HeartRate => &self.heart_rate,
            ProfileField::DailySteps => &self.daily_steps,
            ProfileField::BmiCategory => &self.bmi_category,
            ProfileField::SleepDisorder => &self.sleep_disorder,
            ProfileField::SystolicBp => &self.systolic_bp,
            ProfileField::DiastolicBp => &self.diastolic_bp,
        }
    }

    pub fn set(&mut self, field: ProfileField, value: impl Into<String>) {
        let slot = match field {
            ProfileField::Name => &mut self.name,
            ProfileField::Email => &mut self.email,
            ProfileField::Gender => &mut self.gender,
            ProfileField::Age => &mut self.age,
            ProfileField::Height => &mut self.height,
            ProfileField::Weight => &mut self.weight,
            ProfileField::SleepDuration => &mut self.sleep_duration,
            ProfileField::SleepQuality => &mut self.sleep_quality,
            ProfileField::HeartRate => &mut self.heart_rate,
            ProfileField::DailySteps => &mut self.daily_steps,
            ProfileField::BmiCategory => &mut self.bmi_category,
            ProfileField::SleepDisorder => &mut self.sleep_disorder,
            ProfileField::SystolicBp => &mut self.systolic_bp,
            ProfileField::DiastolicBp => &mut self.diastolic_bp,
        };
        *slot = value.into();
    }

    /// Copy of this profile with one field replaced
    pub fn with(&self, field: ProfileField, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.set(field, value);
        next
    }

    /// Value to render for `field`, substituting the presentation default
    /// for an empty entry.
    pub fn display_value(&self, field: ProfileField) -> &str {
        let value = self.get(field);
        if value.is_empty() {
            field.presentation_default()
        } else {
            value
        }
    }

    /// Flatten into the persisted key/value layout
    pub fn to_entries(&self) -> BTreeMap<String, String> {
        ProfileField::ALL
            .iter()
            .map(|field| (field.key().to_string(), self.get(*field).to_string()))
            .collect()
    }

    /// Rebuild from the persisted layout; missing keys become `""` and
    /// unknown keys are ignored.
    pub fn from_entries(entries: &BTreeMap<String, String>) -> Self {
        let mut profile = UserProfile::default();
        for field in ProfileField::ALL {
            if let Some(value) = entries.get(field.key()) {
                profile.set(field, value.clone());
            }
        }
        profile
    }
}

/// One sleep session record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepSession {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SleepSession {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// Raw results of one fetch cycle; never persisted directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSnapshot {
    pub step_count: u64,
    pub sleep_sessions: Vec<SleepSession>,
    pub average_heart_rate: f64,
}

impl FetchSnapshot {
    /// True when nothing in the snapshot would change a profile
    pub fn is_empty(&self) -> bool {
        self.step_count == 0 && self.sleep_sessions.is_empty() && self.average_heart_rate <= 0.0
    }
}
