//! Dimension keys and registry record shapes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const INSTRUMENT: &str = "instrument";
pub const DETECTOR: &str = "detector";
pub const PHYSICAL_FILTER: &str = "physical_filter";
pub const VISIT_SYSTEM: &str = "visit_system";
pub const VISIT: &str = "visit";

/// One component of a natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Int(i64),
    Str(String),
}

impl std::fmt::Display for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Str(v) => f.write_str(v),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Natural key of a dimension record: the key fields of every required
/// dimension plus the record's own key field, which is named after its dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(BTreeMap<String, KeyValue>);

impl NaturalKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<KeyValue>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&KeyValue> {
        self.0.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &KeyValue)> {
        self.0.iter()
    }

    /// Merge another key's fields into this one.
    pub fn extend(&mut self, other: &NaturalKey) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Canonical storage encoding: a JSON object with sorted field names.
    pub fn encode(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    pub fn decode(encoded: &str) -> serde_json::Result<Self> {
        serde_json::from_str(encoded).map(Self)
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Reference from one record to a dimension record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimensionRef {
    pub dimension: String,
    pub key: NaturalKey,
}

impl DimensionRef {
    pub fn new(dimension: impl Into<String>, key: NaturalKey) -> Self {
        Self {
            dimension: dimension.into(),
            key,
        }
    }
}

impl std::fmt::Display for DimensionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.dimension, self.key)
    }
}

/// Declaration of a dimension an exposure can reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionSpec {
    pub name: String,
    /// Observation property or extra field supplying this dimension's own key.
    pub key_source: String,
    /// Dimensions whose keys are part of this one's natural key.
    #[serde(default)]
    pub requires: Vec<String>,
    /// A missing key is a resolution failure rather than a skipped reference.
    #[serde(default)]
    pub required: bool,
}

/// Row in an ancillary dimension table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub dimension: String,
    pub key: NaturalKey,
    #[serde(default)]
    pub requires: Vec<DimensionRef>,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl DependencyRecord {
    pub fn new(dimension: impl Into<String>, key: NaturalKey) -> Self {
        Self {
            dimension: dimension.into(),
            key,
            requires: Vec::new(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn reference(&self) -> DimensionRef {
        DimensionRef::new(self.dimension.clone(), self.key.clone())
    }
}

/// Primary registry row for one observed exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureRecord {
    pub instrument: String,
    pub id: i64,
    pub detector: DimensionRef,
    pub obs_id: Option<String>,
    pub physical_filter: Option<String>,
    pub observation_type: Option<String>,
    pub datetime_begin: Option<DateTime<Utc>>,
    pub datetime_end: Option<DateTime<Utc>>,
    pub exposure_time: Option<f64>,
    pub day_obs: Option<i64>,
    pub group_name: Option<String>,
    pub group_id: Option<i64>,
    pub science_program: Option<String>,
    pub target_name: Option<String>,
    pub observation_reason: Option<String>,
    /// Instrument-specific columns.
    #[serde(default)]
    pub extras: serde_json::Map<String, serde_json::Value>,
    /// Every foreign key of this record, detector included.
    #[serde(default)]
    pub references: Vec<DimensionRef>,
}

impl ExposureRecord {
    /// Column names the standard mapping owns; instrument extras may not reuse them.
    pub const STANDARD_COLUMNS: [&'static str; 15] = [
        "instrument",
        "id",
        "detector",
        "obs_id",
        "physical_filter",
        "observation_type",
        "datetime_begin",
        "datetime_end",
        "exposure_time",
        "day_obs",
        "group_name",
        "group_id",
        "science_program",
        "target_name",
        "observation_reason",
    ];

    pub fn detector_num(&self) -> Option<i64> {
        match self.detector.key.get(DETECTOR) {
            Some(KeyValue::Int(n)) => Some(*n),
            _ => None,
        }
    }

    /// Whether the exposure-level columns (everything but the detector) agree.
    pub fn same_exposure_as(&self, other: &ExposureRecord) -> bool {
        self.instrument == other.instrument
            && self.id == other.id
            && self.obs_id == other.obs_id
            && self.physical_filter == other.physical_filter
            && self.observation_type == other.observation_type
            && self.datetime_begin == other.datetime_begin
            && self.datetime_end == other.datetime_end
            && self.exposure_time == other.exposure_time
            && self.day_obs == other.day_obs
            && self.group_name == other.group_name
            && self.group_id == other.group_id
            && self.science_program == other.science_program
            && self.target_name == other.target_name
            && self.observation_reason == other.observation_reason
            && self.extras == other.extras
    }
}

/// Link between a file and the exposure/detector it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDatasetAssociation {
    pub dataset_id: String,
    pub instrument: String,
    pub exposure_id: i64,
    pub detector: DimensionRef,
    pub location: String,
    pub checksum: Option<String>,
    pub ingested_at: DateTime<Utc>,
}
