//! Dimension dependency graph.
//!
//! Nodes are dimensions, edges run from a required dimension to the one that
//! requires it. A topological order tells the resolver which records must
//! exist before which.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use obsingest_core::dimension::{DETECTOR, INSTRUMENT, PHYSICAL_FILTER, VISIT, VISIT_SYSTEM};
use obsingest_core::{DimensionSpec, Error, InstrumentDescriptor, Result};

/// Dimensions created by the visit definer, not by raw ingestion.
const RESERVED: [&str; 3] = ["exposure", VISIT, VISIT_SYSTEM];

/// Dimensions every instrument references.
pub fn standard_dimensions() -> Vec<DimensionSpec> {
    vec![
        DimensionSpec {
            name: INSTRUMENT.into(),
            key_source: "instrument".into(),
            requires: Vec::new(),
            required: true,
        },
        DimensionSpec {
            name: DETECTOR.into(),
            key_source: "detector_num".into(),
            requires: vec![INSTRUMENT.into()],
            required: true,
        },
        DimensionSpec {
            name: PHYSICAL_FILTER.into(),
            key_source: "physical_filter".into(),
            requires: vec![INSTRUMENT.into()],
            required: false,
        },
    ]
}

/// Validated, dependency-ordered dimension set for one instrument.
#[derive(Debug, Clone)]
pub struct DimensionGraph {
    ordered: Vec<DimensionSpec>,
}

impl DimensionGraph {
    /// Standard dimensions plus the instrument's extras.
    pub fn for_instrument(descriptor: &dyn InstrumentDescriptor) -> Result<Self> {
        let mut specs = standard_dimensions();
        for extra in descriptor.extra_dimensions() {
            if RESERVED.contains(&extra.name.as_str()) {
                return Err(Error::Config(format!(
                    "{}: dimension '{}' is reserved",
                    descriptor.name(),
                    extra.name
                )));
            }
            specs.push(extra);
        }
        let graph = Self::from_specs(specs)?;
        debug!(
            "Dimension order for {}: {:?}",
            descriptor.name(),
            graph.names().collect::<Vec<_>>()
        );
        Ok(graph)
    }

    /// Order `specs` so each dimension follows everything it requires.
    pub fn from_specs(specs: Vec<DimensionSpec>) -> Result<Self> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();

        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.clone(), graph.add_node(i)).is_some() {
                return Err(Error::Config(format!(
                    "dimension '{}' is declared twice",
                    spec.name
                )));
            }
        }
        for spec in &specs {
            let to = index[&spec.name];
            for req in &spec.requires {
                let from = index.get(req).ok_or_else(|| {
                    Error::Config(format!(
                        "dimension '{}' requires unknown dimension '{}'",
                        spec.name, req
                    ))
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            Error::Config(format!(
                "dimension '{}' is part of a dependency cycle",
                specs[graph[cycle.node_id()]].name
            ))
        })?;

        let mut slots: Vec<Option<DimensionSpec>> = specs.into_iter().map(Some).collect();
        let ordered = order
            .into_iter()
            .filter_map(|node| slots[graph[node]].take())
            .collect();
        Ok(Self { ordered })
    }

    pub fn ordered(&self) -> &[DimensionSpec] {
        &self.ordered
    }

    pub fn get(&self, name: &str) -> Option<&DimensionSpec> {
        self.ordered.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ordered.iter().map(|s| s.name.as_str())
    }
}
