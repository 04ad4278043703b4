//! Ingestion run configuration.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::obs_info::ObservationProperty;

/// What to do with the rest of the batch after a per-file failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    #[default]
    SkipAndContinue,
    AbortBatch,
}

/// One observation property requested from the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRequirement {
    pub property: ObservationProperty,
    #[serde(default)]
    pub required: bool,
}

impl PropertyRequirement {
    pub fn required(property: ObservationProperty) -> Self {
        Self {
            property,
            required: true,
        }
    }

    pub fn optional(property: ObservationProperty) -> Self {
        Self {
            property,
            required: false,
        }
    }
}

/// Exposure grouping algorithm used to define visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VisitGrouping {
    #[default]
    OneToOne,
    ByGroupMetadata,
}

impl VisitGrouping {
    /// Visit system (id, name) implemented by this grouping.
    pub fn visit_system(&self) -> (i64, &'static str) {
        match self {
            Self::OneToOne => (0, "one-to-one"),
            Self::ByGroupMetadata => (1, "by-group-metadata"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitDefinitionConfig {
    #[serde(default)]
    pub grouping: VisitGrouping,
    #[serde(default = "default_true")]
    pub ignore_non_science: bool,
}

impl Default for VisitDefinitionConfig {
    fn default() -> Self {
        Self {
            grouping: VisitGrouping::default(),
            ignore_non_science: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    1
}

/// Configuration for one ingestion batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Instrument name or alias; resolved once before any file is read.
    pub instrument: String,
    #[serde(default = "default_properties")]
    pub properties: Vec<PropertyRequirement>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Resolve and build, then roll back instead of committing.
    #[serde(default)]
    pub dry_run: bool,
    /// Fail, rather than skip, files whose raw dataset is already registered.
    #[serde(default)]
    pub strict_duplicates: bool,
    #[serde(default = "default_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub define_visits: Option<VisitDefinitionConfig>,
}

/// Standard property set: identity and start time required, the rest optional.
pub fn default_properties() -> Vec<PropertyRequirement> {
    use ObservationProperty::*;
    ObservationProperty::ALL
        .iter()
        .map(|&p| match p {
            Instrument | DetectorNum | ExposureId | DatetimeBegin => PropertyRequirement::required(p),
            _ => PropertyRequirement::optional(p),
        })
        .collect()
}

impl IngestConfig {
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            properties: default_properties(),
            on_failure: FailurePolicy::default(),
            dry_run: false,
            strict_duplicates: false,
            max_workers: default_workers(),
            define_visits: None,
        }
    }

    /// Load a JSON config file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: IngestConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.apply_env();
        config.validate()?;
        info!(
            "Loaded ingest config from {}: instrument={}, policy={:?}, workers={}",
            path.display(),
            config.instrument,
            config.on_failure,
            config.max_workers
        );
        Ok(config)
    }

    /// `OBSINGEST_MAX_WORKERS` and `OBSINGEST_DRY_RUN` override file values.
    pub fn apply_env(&mut self) {
        if let Some(workers) = std::env::var("OBSINGEST_MAX_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.max_workers = workers;
        }
        if let Ok(v) = std::env::var("OBSINGEST_DRY_RUN") {
            self.dry_run = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }

    /// Check the property subset and worker count. Run once per batch.
    pub fn validate(&self) -> Result<()> {
        if self.instrument.trim().is_empty() {
            return Err(Error::Config("instrument must not be empty".into()));
        }
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".into()));
        }

        let mut seen = BTreeSet::new();
        for req in &self.properties {
            if !seen.insert(req.property) {
                return Err(Error::Config(format!(
                    "property '{}' listed more than once",
                    req.property
                )));
            }
        }

        for identity in [
            ObservationProperty::Instrument,
            ObservationProperty::DetectorNum,
            ObservationProperty::ExposureId,
        ] {
            if !self.is_required(identity) {
                return Err(Error::Config(format!(
                    "property '{}' identifies the raw dataset and must be required",
                    identity
                )));
            }
        }
        Ok(())
    }

    pub fn requested(&self) -> impl Iterator<Item = ObservationProperty> + '_ {
        self.properties.iter().map(|r| r.property)
    }

    pub fn is_required(&self, property: ObservationProperty) -> bool {
        self.properties
            .iter()
            .any(|r| r.property == property && r.required)
    }
}
