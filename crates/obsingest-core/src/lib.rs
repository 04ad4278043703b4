//! Core types shared by the obsingest crates: errors, batch configuration,
//! observation metadata and instrument descriptors.

pub mod config;
pub mod dimension;
pub mod error;
pub mod instrument;
pub mod obs_info;

pub use config::{FailurePolicy, IngestConfig, PropertyRequirement, VisitDefinitionConfig, VisitGrouping};
pub use dimension::{
    DependencyRecord, DimensionRef, DimensionSpec, ExposureRecord, KeyValue, NaturalKey,
    RawDatasetAssociation,
};
pub use error::{Error, ErrorKind, Result};
pub use instrument::{GenericInstrument, InstrumentDefinition, InstrumentDescriptor, InstrumentIdentityProvider};
pub use obs_info::{ObservationInfo, ObservationProperty};
