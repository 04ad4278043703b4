//! Per-file ingest stages: header extraction, dependency resolution and
//! exposure record building. Visit definition lives here too.

pub mod builder;
pub mod extract;
pub mod graph;
pub mod resolver;
pub mod visits;

pub use builder::ExposureRecordBuilder;
pub use extract::{
    read_header, FitsHeader, FitsHeaderExtractor, HeaderValue, ObservationInfoExtractor,
};
pub use graph::DimensionGraph;
pub use resolver::{DependencyResolver, ResolvedDependencies, ResolvedDependency};
pub use visits::{VisitDefiner, VisitDefinitionData, VisitReport};
