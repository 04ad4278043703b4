//! Instrument descriptors and the identity provider that looks them up.
//!
//! An `InstrumentDescriptor` is the capability set an instrument exposes to
//! ingestion: which header keywords carry which observation properties,
//! which extra dimensions its exposures reference, and hooks that add
//! instrument-specific columns to exposure and dependency records.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dimension::DimensionSpec;
use crate::error::{Error, Result};
use crate::obs_info::{ObservationInfo, ObservationProperty};

/// Trait implemented by every supported instrument.
pub trait InstrumentDescriptor: Send + Sync {
    /// Canonical instrument name.
    fn name(&self) -> &str;

    /// Alternative names accepted by the identity provider.
    fn aliases(&self) -> &[String] {
        &[]
    }

    /// Dimensions beyond instrument, detector and physical_filter that
    /// exposures of this instrument reference.
    fn extra_dimensions(&self) -> Vec<DimensionSpec> {
        Vec::new()
    }

    /// Header keyword that carries each observation property.
    fn header_map(&self) -> &BTreeMap<ObservationProperty, String>;

    /// Header keywords copied into `ObservationInfo::extra`, keyed by the extra field name.
    fn extra_headers(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Hours subtracted from the start time before taking the observing-night date.
    fn day_obs_offset_hours(&self) -> i64 {
        0
    }

    /// Instrument-specific exposure columns.
    fn build_exposure_extras(
        &self,
        _info: &ObservationInfo,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        Ok(serde_json::Map::new())
    }

    /// Instrument-specific descriptive fields for a new dependency record.
    fn build_dependency_extras(
        &self,
        _dimension: &str,
        _info: &ObservationInfo,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        Ok(serde_json::Map::new())
    }
}

/// Serialized description of a configuration-driven instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_header_map")]
    pub header_map: BTreeMap<ObservationProperty, String>,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_dimensions: Vec<DimensionSpec>,
    /// Constant descriptive fields per dimension name.
    #[serde(default)]
    pub dependency_fields: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
    /// Constant exposure extras.
    #[serde(default)]
    pub exposure_fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub day_obs_offset_hours: i64,
}

/// Header keywords of a plain FITS primary header.
pub fn default_header_map() -> BTreeMap<ObservationProperty, String> {
    use ObservationProperty::*;
    [
        (Instrument, "INSTRUME"),
        (DetectorNum, "DETECTOR"),
        (DetectorName, "DETNAME"),
        (ExposureId, "EXP-ID"),
        (ObservationId, "OBSID"),
        (DatetimeBegin, "DATE-OBS"),
        (DatetimeEnd, "DATE-END"),
        (ExposureTime, "EXPTIME"),
        (PhysicalFilter, "FILTER"),
        (ObservationType, "IMAGETYP"),
        (GroupName, "GROUPID"),
        (GroupId, "VISITID"),
        (ScienceProgram, "PROGRAM"),
        (TargetName, "OBJECT"),
        (ObservationReason, "REASON"),
    ]
    .into_iter()
    .map(|(p, k)| (p, k.to_string()))
    .collect()
}

/// `InstrumentDescriptor` driven entirely by an [`InstrumentDefinition`].
#[derive(Debug, Clone)]
pub struct GenericInstrument {
    def: InstrumentDefinition,
}

impl GenericInstrument {
    pub fn new(def: InstrumentDefinition) -> Self {
        Self { def }
    }

    /// Instrument with the default header map and no extras.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(InstrumentDefinition {
            name: name.into(),
            aliases: Vec::new(),
            header_map: default_header_map(),
            extra_headers: BTreeMap::new(),
            extra_dimensions: Vec::new(),
            dependency_fields: BTreeMap::new(),
            exposure_fields: serde_json::Map::new(),
            day_obs_offset_hours: 0,
        })
    }

    pub fn definition(&self) -> &InstrumentDefinition {
        &self.def
    }
}

impl InstrumentDescriptor for GenericInstrument {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn aliases(&self) -> &[String] {
        &self.def.aliases
    }

    fn extra_dimensions(&self) -> Vec<DimensionSpec> {
        self.def.extra_dimensions.clone()
    }

    fn header_map(&self) -> &BTreeMap<ObservationProperty, String> {
        &self.def.header_map
    }

    fn extra_headers(&self) -> BTreeMap<String, String> {
        self.def.extra_headers.clone()
    }

    fn day_obs_offset_hours(&self) -> i64 {
        self.def.day_obs_offset_hours
    }

    fn build_exposure_extras(
        &self,
        _info: &ObservationInfo,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        Ok(self.def.exposure_fields.clone())
    }

    fn build_dependency_extras(
        &self,
        dimension: &str,
        _info: &ObservationInfo,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        Ok(self
            .def
            .dependency_fields
            .get(dimension)
            .cloned()
            .unwrap_or_default())
    }
}

/// Immutable lookup table from instrument names and aliases to descriptors.
///
/// Built before a batch starts and shared read-only by all workers.
#[derive(Clone, Default)]
pub struct InstrumentIdentityProvider {
    by_name: HashMap<String, Arc<dyn InstrumentDescriptor>>,
}

impl InstrumentIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor under its name and aliases. Lookups are case-insensitive.
    pub fn with(mut self, descriptor: Arc<dyn InstrumentDescriptor>) -> Result<Self> {
        let mut names = vec![descriptor.name().to_string()];
        names.extend(descriptor.aliases().iter().cloned());
        for name in names {
            let key = name.to_lowercase();
            if let Some(existing) = self.by_name.get(&key) {
                return Err(Error::Config(format!(
                    "instrument name '{}' already registered for {}",
                    name,
                    existing.name()
                )));
            }
            self.by_name.insert(key, descriptor.clone());
        }
        Ok(self)
    }

    /// Build a provider of `GenericInstrument`s from a JSON list of definitions.
    pub fn from_definitions_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let defs: Vec<InstrumentDefinition> = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let mut provider = Self::new();
        for def in defs {
            provider = provider.with(Arc::new(GenericInstrument::new(def)))?;
        }
        info!(
            "Loaded {} instrument definition(s) from {}",
            provider.instrument_names().len(),
            path.display()
        );
        Ok(provider)
    }

    pub fn resolve(&self, name_or_alias: &str) -> Result<Arc<dyn InstrumentDescriptor>> {
        self.by_name
            .get(&name_or_alias.to_lowercase())
            .cloned()
            .ok_or_else(|| Error::UnknownInstrument(name_or_alias.to_string()))
    }

    /// Canonical names of all registered instruments, sorted.
    pub fn instrument_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .by_name
            .values()
            .map(|d| d.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl std::fmt::Debug for InstrumentIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentIdentityProvider")
            .field("instruments", &self.instrument_names())
            .finish()
    }
}
