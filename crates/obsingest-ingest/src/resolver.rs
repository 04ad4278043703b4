//! Dependency resolution: which dimension records an exposure needs, and
//! which of them the registry is still missing.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use obsingest_core::dimension::{DETECTOR, INSTRUMENT, PHYSICAL_FILTER};
use obsingest_core::{
    DependencyRecord, DimensionRef, Error, InstrumentDescriptor, NaturalKey, ObservationInfo,
    Result,
};
use obsingest_registry::{RegistryClient, RegistryTransaction, SyncOutcome};

use crate::graph::DimensionGraph;

/// One dependency of an exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDependency {
    /// The stored record when `present`, otherwise the record to insert.
    pub record: DependencyRecord,
    /// Whether the registry already held this record at resolution time.
    pub present: bool,
}

/// Dependencies of one exposure in creation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedDependencies {
    entries: Vec<ResolvedDependency>,
}

impl ResolvedDependencies {
    pub fn iter(&self) -> impl Iterator<Item = &ResolvedDependency> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, dimension: &str) -> Option<&ResolvedDependency> {
        self.entries.iter().find(|e| e.record.dimension == dimension)
    }

    pub fn contains(&self, reference: &DimensionRef) -> bool {
        self.entries
            .iter()
            .any(|e| e.record.dimension == reference.dimension && e.record.key == reference.key)
    }

    /// Records the registry did not have.
    pub fn missing(&self) -> impl Iterator<Item = &DependencyRecord> {
        self.entries.iter().filter(|e| !e.present).map(|e| &e.record)
    }

    pub fn references(&self) -> Vec<DimensionRef> {
        self.entries.iter().map(|e| e.record.reference()).collect()
    }
}

/// Resolves and materializes the dimension records of one instrument's exposures.
pub struct DependencyResolver {
    descriptor: Arc<dyn InstrumentDescriptor>,
    graph: DimensionGraph,
}

impl DependencyResolver {
    /// Fails with a config error when the instrument's dimensions do not form a DAG.
    pub fn new(descriptor: Arc<dyn InstrumentDescriptor>) -> Result<Self> {
        let graph = DimensionGraph::for_instrument(descriptor.as_ref())?;
        Ok(Self { descriptor, graph })
    }

    pub fn descriptor(&self) -> &dyn InstrumentDescriptor {
        self.descriptor.as_ref()
    }

    pub fn graph(&self) -> &DimensionGraph {
        &self.graph
    }

    /// Work out every dependency record of the exposure in `info`.
    ///
    /// Reads the registry but never writes. The result is a plan; the
    /// registry may change before [`materialize`](Self::materialize) runs.
    pub fn resolve(
        &self,
        registry: &dyn RegistryClient,
        info: &ObservationInfo,
    ) -> Result<ResolvedDependencies> {
        info.require_instrument()?;
        info.require_detector()?;
        info.require_exposure_id()?;

        let mut keys: HashMap<&str, NaturalKey> = HashMap::new();
        let mut entries = Vec::new();

        'dims: for spec in self.graph.ordered() {
            let own = if spec.name == INSTRUMENT {
                // Aliases collapse onto the canonical name.
                Some(self.descriptor.name().into())
            } else {
                info.key_value_of(&spec.key_source)
            };
            let own = match own {
                Some(v) => v,
                None if spec.required => {
                    return Err(Error::Resolution(format!(
                        "'{}' is needed for the {} dimension but is missing",
                        spec.key_source, spec.name
                    )))
                }
                None => {
                    debug!("No {} for this observation; skipping", spec.name);
                    continue;
                }
            };

            let mut key = NaturalKey::new();
            let mut requires = Vec::with_capacity(spec.requires.len());
            for req in &spec.requires {
                match keys.get(req.as_str()) {
                    Some(req_key) => {
                        key.extend(req_key);
                        requires.push(DimensionRef::new(req.clone(), req_key.clone()));
                    }
                    None if spec.required => {
                        return Err(Error::Resolution(format!(
                            "{} requires {}, which could not be resolved",
                            spec.name, req
                        )))
                    }
                    None => continue 'dims,
                }
            }
            key.insert(spec.name.clone(), own);

            let mut candidate = DependencyRecord::new(spec.name.clone(), key.clone());
            candidate.requires = requires;
            candidate.fields = self.standard_fields(&spec.name, info);
            for (k, v) in self.descriptor.build_dependency_extras(&spec.name, info)? {
                candidate.fields.insert(k, v);
            }

            let entry = if registry.exists(&spec.name, &key)? {
                match registry.fetch_dependency(&spec.name, &key)? {
                    Some(stored) => {
                        if stored.fields != candidate.fields {
                            warn!(
                                "Stored {} differs from this observation's metadata; keeping the stored record",
                                stored.reference()
                            );
                        }
                        ResolvedDependency {
                            record: stored,
                            present: true,
                        }
                    }
                    None => ResolvedDependency {
                        record: candidate,
                        present: false,
                    },
                }
            } else {
                ResolvedDependency {
                    record: candidate,
                    present: false,
                }
            };

            keys.insert(spec.name.as_str(), key);
            entries.push(entry);
        }

        Ok(ResolvedDependencies { entries })
    }

    /// Insert-if-absent every missing record, in order, inside `tx`.
    pub fn materialize(
        &self,
        tx: &dyn RegistryTransaction,
        resolved: &ResolvedDependencies,
    ) -> Result<Vec<SyncOutcome>> {
        let mut outcomes = Vec::new();
        for record in resolved.missing() {
            let outcome = tx.insert_if_absent(record)?;
            match &outcome {
                SyncOutcome::Inserted(r) => debug!("Created {}", r.reference()),
                SyncOutcome::Existing(r) => {
                    debug!("{} was created concurrently; using it", r.reference())
                }
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn standard_fields(
        &self,
        dimension: &str,
        info: &ObservationInfo,
    ) -> serde_json::Map<String, serde_json::Value> {
        let mut fields = serde_json::Map::new();
        match dimension {
            INSTRUMENT => {
                fields.insert("name".into(), self.descriptor.name().into());
            }
            DETECTOR => {
                if let Some(name) = &info.detector_name {
                    fields.insert("full_name".into(), name.clone().into());
                }
            }
            PHYSICAL_FILTER => {
                if let Some(name) = &info.physical_filter {
                    fields.insert("name".into(), name.clone().into());
                }
            }
            _ => {}
        }
        fields
    }
}
