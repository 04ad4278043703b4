//! Batch ingestion tests against a real on-disk registry.
//!
//! Each test writes small FITS headers into a temp dir, runs the
//! orchestrator and inspects the registry afterwards.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use obsingest_core::dimension::{DETECTOR, INSTRUMENT, VISIT};
use obsingest_core::{
    DependencyRecord, DimensionRef, DimensionSpec, ErrorKind, ExposureRecord, FailurePolicy,
    GenericInstrument, IngestConfig, InstrumentDefinition, InstrumentDescriptor,
    InstrumentIdentityProvider, NaturalKey, ObservationInfo, PropertyRequirement,
    RawDatasetAssociation, Result, VisitDefinitionConfig, VisitGrouping,
};
use obsingest_ingest::extract::render_header;
use obsingest_ingest::{FitsHeaderExtractor, ObservationInfoExtractor};
use obsingest_registry::{
    ExposureInsert, RegistryClient, RegistryTransaction, SqliteRegistry, SyncOutcome,
};
use obsingest_runtime::{BatchOutcome, CancelHandle, FileState, Orchestrator};
use tempfile::TempDir;

fn instrument_x() -> InstrumentDefinition {
    GenericInstrument::named("X").definition().clone()
}

/// Instrument X whose exposures also reference a raft, taken from the RAFT header.
fn instrument_with_raft() -> InstrumentDefinition {
    let mut def = instrument_x();
    def.extra_headers.insert("raft_name".into(), "RAFT".into());
    def.extra_dimensions.push(DimensionSpec {
        name: "raft".into(),
        key_source: "raft_name".into(),
        requires: vec![INSTRUMENT.into()],
        required: true,
    });
    def
}

fn orchestrator(registry: Arc<dyn RegistryClient>, def: InstrumentDefinition) -> Orchestrator {
    orchestrator_with(registry, def, Arc::new(FitsHeaderExtractor))
}

fn orchestrator_with(
    registry: Arc<dyn RegistryClient>,
    def: InstrumentDefinition,
    extractor: Arc<dyn ObservationInfoExtractor>,
) -> Orchestrator {
    let instruments = InstrumentIdentityProvider::new()
        .with(Arc::new(GenericInstrument::new(def)))
        .unwrap();
    Orchestrator::new(registry, extractor, Arc::new(instruments))
}

fn open_registry(dir: &TempDir) -> Arc<SqliteRegistry> {
    Arc::new(SqliteRegistry::open(dir.path().join("registry")).unwrap())
}

fn cards(exposure: i64, detector: i64) -> Vec<(&'static str, String)> {
    vec![
        ("INSTRUME", "'X'".to_string()),
        ("DETECTOR", detector.to_string()),
        ("DETNAME", format!("'S{:02}'", detector)),
        ("EXP-ID", exposure.to_string()),
        ("DATE-OBS", "'2024-03-01T05:00:00'".to_string()),
        ("EXPTIME", "30.0".to_string()),
        ("FILTER", "'r'".to_string()),
        ("IMAGETYP", "'science'".to_string()),
    ]
}

fn write_cards(dir: &Path, name: &str, cards: &[(&str, String)]) -> PathBuf {
    let pairs: Vec<(&str, &str)> = cards.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let path = dir.join(name);
    std::fs::write(&path, render_header(&pairs)).unwrap();
    path
}

fn write_raw(dir: &Path, name: &str, exposure: i64, detector: i64) -> PathBuf {
    write_cards(dir, name, &cards(exposure, detector))
}

fn detector_key(detector: i64) -> NaturalKey {
    NaturalKey::new().with(INSTRUMENT, "X").with(DETECTOR, detector)
}

/// Five files for five exposures of detector 1; the third lacks its RAFT header.
fn five_files_third_unresolvable(dir: &Path) -> Vec<PathBuf> {
    (1..=5)
        .map(|i| {
            let mut c = cards(1000 + i, 1);
            if i != 3 {
                c.push(("RAFT", "'R22'".to_string()));
            }
            write_cards(dir, &format!("f{}.fits", i), &c)
        })
        .collect()
}

#[tokio::test]
async fn test_repeated_ingest_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_x());
    let file = write_raw(dir.path(), "a.fits", 1001, 1);
    let config = IngestConfig::new("X");

    for attempt in 0..3 {
        let report = orch.ingest(vec![file.clone()], &config).await.unwrap();
        let result = &report.results[0];
        assert!(result.is_success());
        assert_eq!(result.duplicate, attempt > 0);
        assert!(report.exit_success());
    }

    assert_eq!(registry.count_exposures().unwrap(), 1);
    assert_eq!(registry.count_datasets().unwrap(), 1);
    assert_eq!(registry.count_dimension_records(DETECTOR).unwrap(), 1);
}

#[tokio::test]
async fn test_two_exposures_share_one_detector_row() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_x());
    let a = write_raw(dir.path(), "a.fits", 1001, 1);
    let b = write_raw(dir.path(), "b.fits", 1002, 1);

    let report = orch.ingest(vec![a, b], &IngestConfig::new("X")).await.unwrap();
    assert_eq!(report.count(FileState::Succeeded), 2);

    assert_eq!(registry.count_dimension_records(DETECTOR).unwrap(), 1);
    assert_eq!(registry.count_exposures().unwrap(), 2);
    let detector = DimensionRef::new(DETECTOR, detector_key(1));
    for id in [1001, 1002] {
        let exposure = registry.fetch_exposure("X", id).unwrap().unwrap();
        assert_eq!(exposure.detector, detector);
        assert!(exposure.references.contains(&detector));
    }
}

#[tokio::test]
async fn test_abort_batch_stops_after_failure() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_with_raft());
    let files = five_files_third_unresolvable(dir.path());

    let mut config = IngestConfig::new("X");
    config.on_failure = FailurePolicy::AbortBatch;
    let report = orch.ingest(files, &config).await.unwrap();

    let states: Vec<FileState> = report.results.iter().map(|r| r.state).collect();
    assert_eq!(
        states,
        vec![
            FileState::Succeeded,
            FileState::Succeeded,
            FileState::Failed,
            FileState::NotAttempted,
            FileState::NotAttempted,
        ]
    );
    assert_eq!(report.results[2].error_kind, Some(ErrorKind::Resolution));
    assert!(matches!(report.outcome, BatchOutcome::Aborted { kind: ErrorKind::Resolution, .. }));
    assert!(!report.exit_success());

    assert_eq!(registry.count_exposures().unwrap(), 2);
    assert!(registry.fetch_exposure("X", 1004).unwrap().is_none());
}

#[tokio::test]
async fn test_skip_and_continue_reports_failure() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_with_raft());
    let files = five_files_third_unresolvable(dir.path());

    let report = orch.ingest(files, &IngestConfig::new("X")).await.unwrap();

    assert_eq!(report.count(FileState::Succeeded), 4);
    let failed: Vec<&Path> = report.failures().map(|r| r.path.as_path()).collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].ends_with("f3.fits"));
    assert_eq!(report.outcome, BatchOutcome::Completed);
    assert!(report.exit_success());
    assert_eq!(registry.count_exposures().unwrap(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_share_dependencies() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_x());

    // Eight exposures on detector 1, plus four detectors of exposure 5000.
    let mut files: Vec<PathBuf> = (0..8)
        .map(|i| write_raw(dir.path(), &format!("e{}.fits", i), 2000 + i, 1))
        .collect();
    files.extend((0..4).map(|d| write_raw(dir.path(), &format!("d{}.fits", d), 5000, d)));

    let mut config = IngestConfig::new("X");
    config.max_workers = 4;
    let report = orch.ingest(files, &config).await.unwrap();

    assert_eq!(report.count(FileState::Succeeded), 12);
    assert_eq!(registry.count_dimension_records(INSTRUMENT).unwrap(), 1);
    assert_eq!(registry.count_dimension_records(DETECTOR).unwrap(), 4);
    assert_eq!(registry.count_exposures().unwrap(), 9);
    assert_eq!(registry.count_datasets().unwrap(), 12);
    assert_eq!(registry.datasets_for_exposure("X", 5000).unwrap().len(), 4);
}

#[tokio::test]
async fn test_missing_required_header_leaves_no_rows() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_x());
    let mut c = cards(1001, 1);
    c.retain(|(k, _)| *k != "EXP-ID");
    let file = write_cards(dir.path(), "a.fits", &c);

    let report = orch.ingest(vec![file], &IngestConfig::new("X")).await.unwrap();

    assert_eq!(report.results[0].state, FileState::Failed);
    assert_eq!(report.results[0].error_kind, Some(ErrorKind::Extraction));
    let stats = registry.get_stats().unwrap();
    assert!(stats.dimension_records.is_empty());
    assert_eq!(stats.exposures, 0);
    assert_eq!(stats.raw_datasets, 0);
}

#[tokio::test]
async fn test_stored_dependency_keeps_its_fields() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_x());
    let first = write_raw(dir.path(), "a.fits", 1001, 1);
    let mut renamed = cards(1002, 1);
    renamed.retain(|(k, _)| *k != "DETNAME");
    renamed.push(("DETNAME", "'renamed'".to_string()));
    let second = write_cards(dir.path(), "b.fits", &renamed);

    orch.ingest(vec![first], &IngestConfig::new("X")).await.unwrap();
    let before = registry.fetch_dependency(DETECTOR, &detector_key(1)).unwrap();
    let report = orch.ingest(vec![second], &IngestConfig::new("X")).await.unwrap();
    let after = registry.fetch_dependency(DETECTOR, &detector_key(1)).unwrap();

    assert!(report.results[0].is_success());
    assert_eq!(before, after);
    assert_eq!(after.unwrap().fields["full_name"], "S01");
}

#[tokio::test]
async fn test_strict_duplicates_fail() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_x());
    let file = write_raw(dir.path(), "a.fits", 1001, 1);

    let mut config = IngestConfig::new("X");
    orch.ingest(vec![file.clone()], &config).await.unwrap();
    config.strict_duplicates = true;
    let report = orch.ingest(vec![file], &config).await.unwrap();

    assert_eq!(report.results[0].error_kind, Some(ErrorKind::DuplicateExposure));
    assert_eq!(registry.count_datasets().unwrap(), 1);
}

#[tokio::test]
async fn test_conflicting_exposure_definition() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_x());
    let a = write_raw(dir.path(), "a.fits", 1001, 0);
    let mut other = cards(1001, 1);
    other.retain(|(k, _)| *k != "EXPTIME");
    other.push(("EXPTIME", "15.0".to_string()));
    let b = write_cards(dir.path(), "b.fits", &other);

    let report = orch.ingest(vec![a, b], &IngestConfig::new("X")).await.unwrap();

    assert!(report.results[0].is_success());
    assert_eq!(report.results[1].error_kind, Some(ErrorKind::ConflictingDefinition));
    assert_eq!(registry.count_datasets().unwrap(), 1);
    // The failed file's detector record was rolled back with it.
    assert_eq!(registry.count_dimension_records(DETECTOR).unwrap(), 1);
    let stored = registry.fetch_exposure("X", 1001).unwrap().unwrap();
    assert_eq!(stored.exposure_time, Some(30.0));
}

#[tokio::test]
async fn test_optional_dimension_chain_without_filter() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let mut def = instrument_x();
    def.extra_headers.insert("slot".into(), "SLOT".into());
    def.extra_dimensions.push(DimensionSpec {
        name: "filter_slot".into(),
        key_source: "slot".into(),
        requires: vec![INSTRUMENT.into(), "physical_filter".into()],
        required: false,
    });
    let orch = orchestrator(registry.clone(), def);
    let files: Vec<PathBuf> = (0..2)
        .map(|detector| {
            let mut c = cards(1001, detector);
            c.retain(|(k, _)| *k != "FILTER");
            c.push(("SLOT", "'A'".to_string()));
            write_cards(dir.path(), &format!("{}.fits", detector), &c)
        })
        .collect();

    let report = orch.ingest(files, &IngestConfig::new("X")).await.unwrap();

    assert_eq!(report.outcome, BatchOutcome::Completed);
    assert_eq!(report.count(FileState::Succeeded), 2);
    assert!(report.exit_success());
    assert_eq!(registry.count_dimension_records("filter_slot").unwrap(), 0);
    assert_eq!(registry.count_datasets().unwrap(), 2);
}

#[tokio::test]
async fn test_conflicting_target_name_is_not_discarded() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_x());
    let mut first = cards(1001, 0);
    first.push(("OBJECT", "'M31'".to_string()));
    let mut second = cards(1001, 1);
    second.push(("OBJECT", "'M33'".to_string()));
    let mut third = cards(1001, 2);
    third.push(("OBJECT", "'M31'".to_string()));
    let files = vec![
        write_cards(dir.path(), "a.fits", &first),
        write_cards(dir.path(), "b.fits", &second),
        write_cards(dir.path(), "c.fits", &third),
    ];

    let report = orch.ingest(files, &IngestConfig::new("X")).await.unwrap();

    assert!(report.results[0].is_success());
    assert_eq!(report.results[1].error_kind, Some(ErrorKind::ConflictingDefinition));
    assert!(report.results[2].is_success());
    assert_eq!(registry.count_datasets().unwrap(), 2);
    let stored = registry.fetch_exposure("X", 1001).unwrap().unwrap();
    assert_eq!(stored.target_name.as_deref(), Some("M31"));
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_x());
    let file = write_raw(dir.path(), "a.fits", 1001, 1);

    let mut config = IngestConfig::new("X");
    config.dry_run = true;
    config.define_visits = Some(VisitDefinitionConfig::default());
    let report = orch.ingest(vec![file], &config).await.unwrap();

    let result = &report.results[0];
    assert!(result.is_success());
    assert!(result.dry_run);
    assert!(report.visits.is_none());
    let stats = registry.get_stats().unwrap();
    assert!(stats.dimension_records.is_empty());
    assert_eq!(stats.exposures, 0);
}

#[tokio::test]
async fn test_batch_fatal_error_aborts_skip_and_continue() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let mut def = instrument_x();
    def.exposure_fields.insert("exposure_time".into(), 1.into());
    let orch = orchestrator(registry.clone(), def);
    let files = vec![
        write_raw(dir.path(), "a.fits", 1001, 1),
        write_raw(dir.path(), "b.fits", 1002, 1),
    ];

    let report = orch.ingest(files, &IngestConfig::new("X")).await.unwrap();

    assert_eq!(report.results[0].error_kind, Some(ErrorKind::RecordBuild));
    assert_eq!(report.results[1].state, FileState::NotAttempted);
    assert!(matches!(report.outcome, BatchOutcome::Aborted { kind: ErrorKind::RecordBuild, .. }));
    assert!(!report.exit_success());
}

#[tokio::test]
async fn test_invalid_property_subset_rejected_before_any_file() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_x());
    let file = write_raw(dir.path(), "a.fits", 1001, 1);

    let mut config = IngestConfig::new("X");
    config.properties = vec![PropertyRequirement::required(
        obsingest_core::ObservationProperty::Instrument,
    )];
    let err = orch.ingest(vec![file], &config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(registry.count_exposures().unwrap(), 0);
}

/// Extractor that trips a cancel handle while extracting the n-th file.
struct CancelDuring {
    cancel: CancelHandle,
    at: usize,
    seen: AtomicUsize,
}

impl ObservationInfoExtractor for CancelDuring {
    fn extract(
        &self,
        bytes: &[u8],
        instrument: &dyn InstrumentDescriptor,
        properties: &[PropertyRequirement],
    ) -> Result<ObservationInfo> {
        if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.at {
            self.cancel.cancel();
        }
        FitsHeaderExtractor.extract(bytes, instrument, properties)
    }
}

#[tokio::test]
async fn test_cancel_between_files() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let cancel = CancelHandle::new();
    let extractor = Arc::new(CancelDuring {
        cancel: cancel.clone(),
        at: 2,
        seen: AtomicUsize::new(0),
    });
    let orch = orchestrator_with(registry.clone(), instrument_x(), extractor);
    let files: Vec<PathBuf> = (0..4)
        .map(|i| write_raw(dir.path(), &format!("f{}.fits", i), 3000 + i, 1))
        .collect();

    let report = orch
        .ingest_with_cancel(files, &IngestConfig::new("X"), cancel)
        .await
        .unwrap();

    assert_eq!(report.outcome, BatchOutcome::Cancelled);
    assert_eq!(report.count(FileState::Succeeded), 2);
    assert_eq!(report.count(FileState::NotAttempted), 2);
    // The file in flight when cancellation arrived was committed in full.
    assert_eq!(registry.count_exposures().unwrap(), 2);
    assert_eq!(registry.count_datasets().unwrap(), 2);
}

/// Registry whose transactions silently drop detector inserts, so the
/// exposure insert hits the foreign-key check.
struct DropsDetectors(SqliteRegistry);

struct DropsDetectorsTx<'a> {
    inner: Box<dyn RegistryTransaction + 'a>,
}

impl RegistryClient for DropsDetectors {
    fn begin(&self) -> Result<Box<dyn RegistryTransaction + '_>> {
        Ok(Box::new(DropsDetectorsTx {
            inner: self.0.begin()?,
        }))
    }

    fn exists(&self, dimension: &str, key: &NaturalKey) -> Result<bool> {
        self.0.exists(dimension, key)
    }

    fn fetch_dependency(&self, dimension: &str, key: &NaturalKey) -> Result<Option<DependencyRecord>> {
        self.0.fetch_dependency(dimension, key)
    }

    fn fetch_exposure(&self, instrument: &str, id: i64) -> Result<Option<ExposureRecord>> {
        self.0.fetch_exposure(instrument, id)
    }
}

impl RegistryTransaction for DropsDetectorsTx<'_> {
    fn exists(&self, dimension: &str, key: &NaturalKey) -> Result<bool> {
        self.inner.exists(dimension, key)
    }

    fn fetch_dependency(&self, dimension: &str, key: &NaturalKey) -> Result<Option<DependencyRecord>> {
        self.inner.fetch_dependency(dimension, key)
    }

    fn insert_if_absent(&self, record: &DependencyRecord) -> Result<SyncOutcome> {
        if record.dimension == DETECTOR {
            return Ok(SyncOutcome::Inserted(record.clone()));
        }
        self.inner.insert_if_absent(record)
    }

    fn dataset_exists(&self, instrument: &str, exposure_id: i64, detector: &DimensionRef) -> Result<bool> {
        self.inner.dataset_exists(instrument, exposure_id, detector)
    }

    fn insert_exposure(&self, record: &ExposureRecord) -> Result<ExposureInsert> {
        self.inner.insert_exposure(record)
    }

    fn associate_dataset(&self, association: &RawDatasetAssociation) -> Result<()> {
        self.inner.associate_dataset(association)
    }

    fn insert_visit_definition(&self, visit: &DimensionRef, instrument: &str, exposure_id: i64) -> Result<bool> {
        self.inner.insert_visit_definition(visit, instrument, exposure_id)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit()
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback()
    }
}

#[tokio::test]
async fn test_foreign_key_failure_rolls_back_file() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(DropsDetectors(SqliteRegistry::open(dir.path()).unwrap()));
    let orch = orchestrator(registry.clone(), instrument_x());
    let file = write_raw(dir.path(), "a.fits", 1001, 1);

    let report = orch.ingest(vec![file], &IngestConfig::new("X")).await.unwrap();

    assert_eq!(report.results[0].error_kind, Some(ErrorKind::ForeignKeyViolation));
    assert!(report.exit_success());
    // The instrument row inserted earlier in the same transaction is gone too.
    let stats = registry.0.get_stats().unwrap();
    assert!(stats.dimension_records.is_empty());
    assert_eq!(stats.exposures, 0);
}

#[tokio::test]
async fn test_visits_defined_after_batch() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_x());
    let files: Vec<PathBuf> = [(4001, "snap_1"), (4002, "snap_1"), (4003, "snap_2")]
        .into_iter()
        .map(|(id, group)| {
            let mut c = cards(id, 1);
            c.push(("GROUPID", format!("'{}'", group)));
            c.push(("VISITID", if group == "snap_1" { "41" } else { "42" }.to_string()));
            write_cards(dir.path(), &format!("{}.fits", id), &c)
        })
        .collect();

    let mut config = IngestConfig::new("X");
    config.define_visits = Some(VisitDefinitionConfig {
        grouping: VisitGrouping::ByGroupMetadata,
        ignore_non_science: true,
    });
    let report = orch.ingest(files, &config).await.unwrap();

    let visits = report.visits.clone().unwrap();
    assert_eq!(visits.visits_defined, 2);
    assert!(report.exit_success());

    let visit = DimensionRef::new(VISIT, NaturalKey::new().with(INSTRUMENT, "X").with(VISIT, 41));
    assert_eq!(registry.visit_exposures(&visit).unwrap(), vec![4001, 4002]);
    let stored = registry.fetch_dependency(VISIT, &visit.key).unwrap().unwrap();
    assert_eq!(stored.fields["exposure_time"], 60.0);
}

#[tokio::test]
async fn test_later_batch_cannot_grow_a_visit() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let orch = orchestrator(registry.clone(), instrument_x());
    let snap = |id: i64| {
        let mut c = cards(id, 1);
        c.push(("GROUPID", "'snap'".to_string()));
        c.push(("VISITID", "77".to_string()));
        write_cards(dir.path(), &format!("{}.fits", id), &c)
    };
    let mut config = IngestConfig::new("X");
    config.define_visits = Some(VisitDefinitionConfig {
        grouping: VisitGrouping::ByGroupMetadata,
        ignore_non_science: true,
    });

    let first = orch.ingest(vec![snap(1)], &config).await.unwrap();
    assert_eq!(first.visits.unwrap().visits_defined, 1);

    let second = orch.ingest(vec![snap(2)], &config).await.unwrap();
    assert!(second.results[0].is_success());
    assert!(second.visits.is_none());
    assert!(second.visit_error.is_some());
    assert!(!second.exit_success());

    let visit = DimensionRef::new(VISIT, NaturalKey::new().with(INSTRUMENT, "X").with(VISIT, 77));
    assert_eq!(registry.visit_exposures(&visit).unwrap(), vec![1]);
    let stored = registry.fetch_dependency(VISIT, &visit.key).unwrap().unwrap();
    assert_eq!(stored.fields["exposure_time"], 30.0);
}
