//! Registry client traits.
//!
//! `RegistryClient` is the read side plus the entry point for transactions.
//! Every write goes through a `RegistryTransaction`, which rolls back when
//! dropped without an explicit `commit`.

use obsingest_core::{
    DependencyRecord, DimensionRef, ExposureRecord, NaturalKey, RawDatasetAssociation, Result,
};

/// Result of an insert-if-absent on a dimension record.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The record was new and has been written.
    Inserted(DependencyRecord),
    /// A record with the same natural key already existed; it is returned unchanged.
    Existing(DependencyRecord),
}

impl SyncOutcome {
    pub fn inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }

    pub fn record(&self) -> &DependencyRecord {
        match self {
            Self::Inserted(r) | Self::Existing(r) => r,
        }
    }

    pub fn into_record(self) -> DependencyRecord {
        match self {
            Self::Inserted(r) | Self::Existing(r) => r,
        }
    }
}

/// Result of inserting an exposure row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureInsert {
    Inserted,
    /// The exposure row was already present with identical exposure-level
    /// columns (typically another detector of the same exposure); only the
    /// new references were added.
    Existing,
}

/// Scoped registry transaction.
pub trait RegistryTransaction {
    fn exists(&self, dimension: &str, key: &NaturalKey) -> Result<bool>;

    fn fetch_dependency(&self, dimension: &str, key: &NaturalKey)
        -> Result<Option<DependencyRecord>>;

    /// Insert `record` unless its natural key is already present.
    ///
    /// Safe under concurrent duplicate attempts: the first writer wins and
    /// later callers get [`SyncOutcome::Existing`]. Never overwrites.
    fn insert_if_absent(&self, record: &DependencyRecord) -> Result<SyncOutcome>;

    /// Whether a raw dataset is already registered for this exposure and detector.
    fn dataset_exists(&self, instrument: &str, exposure_id: i64, detector: &DimensionRef)
        -> Result<bool>;

    /// Insert the exposure row and its references.
    ///
    /// Fails with `ForeignKeyViolation` when a referenced dimension record is
    /// missing and with `ConflictingDefinition` when an existing row for the
    /// same exposure disagrees with `record`.
    fn insert_exposure(&self, record: &ExposureRecord) -> Result<ExposureInsert>;

    fn associate_dataset(&self, association: &RawDatasetAssociation) -> Result<()>;

    /// Link an exposure to a visit. Returns false if the link already existed.
    fn insert_visit_definition(
        &self,
        visit: &DimensionRef,
        instrument: &str,
        exposure_id: i64,
    ) -> Result<bool>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Transactional registry with foreign-key enforcement.
pub trait RegistryClient: Send + Sync {
    /// Start a transaction. Blocks until the registry grants write access.
    fn begin(&self) -> Result<Box<dyn RegistryTransaction + '_>>;

    fn exists(&self, dimension: &str, key: &NaturalKey) -> Result<bool>;

    fn fetch_dependency(&self, dimension: &str, key: &NaturalKey)
        -> Result<Option<DependencyRecord>>;

    fn fetch_exposure(&self, instrument: &str, id: i64) -> Result<Option<ExposureRecord>>;
}
