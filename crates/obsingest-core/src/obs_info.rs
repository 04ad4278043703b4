//! Normalized per-file observation metadata.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::dimension::KeyValue;
use crate::error::{Error, Result};

/// A standard observation property that an extractor can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationProperty {
    Instrument,
    DetectorNum,
    DetectorName,
    ExposureId,
    ObservationId,
    DatetimeBegin,
    DatetimeEnd,
    ExposureTime,
    PhysicalFilter,
    ObservationType,
    GroupName,
    GroupId,
    ScienceProgram,
    TargetName,
    ObservationReason,
}

impl ObservationProperty {
    pub const ALL: [ObservationProperty; 15] = [
        Self::Instrument,
        Self::DetectorNum,
        Self::DetectorName,
        Self::ExposureId,
        Self::ObservationId,
        Self::DatetimeBegin,
        Self::DatetimeEnd,
        Self::ExposureTime,
        Self::PhysicalFilter,
        Self::ObservationType,
        Self::GroupName,
        Self::GroupId,
        Self::ScienceProgram,
        Self::TargetName,
        Self::ObservationReason,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instrument => "instrument",
            Self::DetectorNum => "detector_num",
            Self::DetectorName => "detector_name",
            Self::ExposureId => "exposure_id",
            Self::ObservationId => "observation_id",
            Self::DatetimeBegin => "datetime_begin",
            Self::DatetimeEnd => "datetime_end",
            Self::ExposureTime => "exposure_time",
            Self::PhysicalFilter => "physical_filter",
            Self::ObservationType => "observation_type",
            Self::GroupName => "group_name",
            Self::GroupId => "group_id",
            Self::ScienceProgram => "science_program",
            Self::TargetName => "target_name",
            Self::ObservationReason => "observation_reason",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == name)
    }
}

impl std::fmt::Display for ObservationProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable observation metadata for one raw file.
///
/// Built once by an extractor and only read afterwards. Fields the run did
/// not request, or that the header did not carry, are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationInfo {
    pub instrument: Option<String>,
    pub detector_num: Option<i64>,
    pub detector_name: Option<String>,
    pub exposure_id: Option<i64>,
    pub observation_id: Option<String>,
    pub datetime_begin: Option<DateTime<Utc>>,
    pub datetime_end: Option<DateTime<Utc>>,
    /// Exposure duration in seconds.
    pub exposure_time: Option<f64>,
    pub physical_filter: Option<String>,
    pub observation_type: Option<String>,
    pub group_name: Option<String>,
    pub group_id: Option<i64>,
    pub science_program: Option<String>,
    pub target_name: Option<String>,
    pub observation_reason: Option<String>,
    /// Instrument-specific values keyed by name.
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ObservationInfo {
    pub fn has(&self, property: ObservationProperty) -> bool {
        self.value_of(property.as_str()).is_some()
    }

    /// Look up a standard property or an `extra` entry by name.
    pub fn value_of(&self, name: &str) -> Option<serde_json::Value> {
        use serde_json::Value;
        let standard = match ObservationProperty::from_name(name) {
            Some(p) => p,
            None => return self.extra.get(name).filter(|v| !v.is_null()).cloned(),
        };
        match standard {
            ObservationProperty::Instrument => self.instrument.clone().map(Value::from),
            ObservationProperty::DetectorNum => self.detector_num.map(Value::from),
            ObservationProperty::DetectorName => self.detector_name.clone().map(Value::from),
            ObservationProperty::ExposureId => self.exposure_id.map(Value::from),
            ObservationProperty::ObservationId => self.observation_id.clone().map(Value::from),
            ObservationProperty::DatetimeBegin => {
                self.datetime_begin.map(|t| Value::from(t.to_rfc3339()))
            }
            ObservationProperty::DatetimeEnd => {
                self.datetime_end.map(|t| Value::from(t.to_rfc3339()))
            }
            ObservationProperty::ExposureTime => self.exposure_time.map(Value::from),
            ObservationProperty::PhysicalFilter => self.physical_filter.clone().map(Value::from),
            ObservationProperty::ObservationType => {
                self.observation_type.clone().map(Value::from)
            }
            ObservationProperty::GroupName => self.group_name.clone().map(Value::from),
            ObservationProperty::GroupId => self.group_id.map(Value::from),
            ObservationProperty::ScienceProgram => self.science_program.clone().map(Value::from),
            ObservationProperty::TargetName => self.target_name.clone().map(Value::from),
            ObservationProperty::ObservationReason => {
                self.observation_reason.clone().map(Value::from)
            }
        }
    }

    /// Value of `name` as a natural-key component.
    pub fn key_value_of(&self, name: &str) -> Option<KeyValue> {
        match self.value_of(name)? {
            serde_json::Value::String(s) => Some(KeyValue::Str(s)),
            serde_json::Value::Number(n) => n.as_i64().map(KeyValue::Int),
            _ => None,
        }
    }

    pub fn require_instrument(&self) -> Result<&str> {
        self.instrument
            .as_deref()
            .ok_or_else(|| Error::Resolution("observation has no instrument".into()))
    }

    pub fn require_detector(&self) -> Result<i64> {
        self.detector_num
            .ok_or_else(|| Error::Resolution("observation has no detector number".into()))
    }

    pub fn require_exposure_id(&self) -> Result<i64> {
        self.exposure_id
            .ok_or_else(|| Error::Resolution("observation has no exposure id".into()))
    }

    /// Representative timestamp of the observation.
    ///
    /// Midpoint of begin and end when both are known, otherwise begin plus
    /// half the exposure time, otherwise begin.
    pub fn observation_timestamp(&self) -> Option<DateTime<Utc>> {
        let begin = self.datetime_begin?;
        if let Some(end) = self.datetime_end {
            return Some(begin + (end - begin) / 2);
        }
        match self.exposure_time {
            Some(secs) if secs.is_finite() && secs >= 0.0 => {
                let half_ns = (secs * 1e9 / 2.0).round() as i64;
                Some(begin + Duration::nanoseconds(half_ns))
            }
            _ => Some(begin),
        }
    }

    /// End of the observation, inferred from begin and exposure time when the header omits it.
    pub fn effective_end(&self) -> Option<DateTime<Utc>> {
        if self.datetime_end.is_some() {
            return self.datetime_end;
        }
        let begin = self.datetime_begin?;
        let secs = self.exposure_time.filter(|s| s.is_finite() && *s >= 0.0)?;
        Some(begin + Duration::nanoseconds((secs * 1e9).round() as i64))
    }

    /// Observing-night date (YYYYMMDD) of the start time shifted by `offset_hours`.
    pub fn day_obs(&self, offset_hours: i64) -> Option<i64> {
        let shifted = self.datetime_begin? - Duration::hours(offset_hours);
        shifted.format("%Y%m%d").to_string().parse().ok()
    }

    pub fn is_science(&self) -> bool {
        self.observation_type.as_deref() == Some("science")
    }
}
