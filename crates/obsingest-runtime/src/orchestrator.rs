//! Drives each raw file through extract, resolve, build and commit, then
//! assembles the batch report.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use obsingest_core::{
    Error, ErrorKind, IngestConfig, InstrumentIdentityProvider, RawDatasetAssociation, Result,
    VisitDefinitionConfig,
};
use obsingest_ingest::{
    read_header, DependencyResolver, ExposureRecordBuilder, ObservationInfoExtractor,
    VisitDefiner,
};
use obsingest_registry::{ExposureInsert, RegistryClient};

use crate::types::*;

/// Everything a worker needs; shared read-only across the batch.
struct BatchContext {
    registry: Arc<dyn RegistryClient>,
    extractor: Arc<dyn ObservationInfoExtractor>,
    resolver: DependencyResolver,
    config: IngestConfig,
}

/// What a worker learned about a file before it finished or failed.
struct FileProgress {
    stage: FileStage,
    exposure_id: Option<i64>,
    detector: Option<i64>,
}

impl FileProgress {
    fn enter(&mut self, stage: FileStage, path: &Path) {
        debug!("{}: {:?} -> {:?}", path.display(), self.stage, stage);
        self.stage = stage;
    }
}

struct Committed {
    dataset_id: Option<String>,
    duplicate: bool,
}

/// Top-level ingestion orchestrator.
pub struct Orchestrator {
    registry: Arc<dyn RegistryClient>,
    extractor: Arc<dyn ObservationInfoExtractor>,
    instruments: Arc<InstrumentIdentityProvider>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        extractor: Arc<dyn ObservationInfoExtractor>,
        instruments: Arc<InstrumentIdentityProvider>,
    ) -> Self {
        Self {
            registry,
            extractor,
            instruments,
        }
    }

    /// Ingest `files` and report on each of them.
    ///
    /// Errors only when the batch cannot start: invalid configuration, an
    /// unknown instrument or a malformed dimension graph.
    pub async fn ingest(&self, files: Vec<PathBuf>, config: &IngestConfig) -> Result<IngestReport> {
        self.ingest_with_cancel(files, config, CancelHandle::new())
            .await
    }

    /// Like [`ingest`](Self::ingest); cancelling `cancel` stops dispatching
    /// new files while in-flight files finish their commit or rollback.
    pub async fn ingest_with_cancel(
        &self,
        files: Vec<PathBuf>,
        config: &IngestConfig,
        cancel: CancelHandle,
    ) -> Result<IngestReport> {
        let started_at = Utc::now();
        config.validate()?;
        let descriptor = self.instruments.resolve(&config.instrument)?;
        let instrument = descriptor.name().to_string();
        let resolver = DependencyResolver::new(descriptor)?;

        info!(
            "Ingesting {} file(s) for {} (policy={:?}, workers={}, dry_run={})",
            files.len(),
            instrument,
            config.on_failure,
            config.max_workers,
            config.dry_run
        );

        let ctx = Arc::new(BatchContext {
            registry: self.registry.clone(),
            extractor: self.extractor.clone(),
            resolver,
            config: config.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(config.max_workers));
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(files.len());
        let mut cancelled = false;

        for (index, path) in files.iter().enumerate() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(format!("worker pool closed: {}", e)))?;
            if cancel.is_cancelled() {
                info!("Batch cancelled; {} file(s) not dispatched", files.len() - index);
                cancelled = true;
                break;
            }
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let ctx = ctx.clone();
            let stop = stop.clone();
            let path = path.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let result = ingest_file(&ctx, path);
                if result.stops_batch(ctx.config.on_failure) {
                    stop.store(true, Ordering::SeqCst);
                }
                result
            });
            handles.push((index, handle));
        }

        let mut results: Vec<Option<IngestResult>> = vec![None; files.len()];
        for (index, handle) in handles {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => {
                    let err = Error::Internal(format!("worker failed: {}", e));
                    stop.store(true, Ordering::SeqCst);
                    IngestResult::failed(files[index].clone(), FileStage::Pending, &err)
                }
            };
            results[index] = Some(result);
        }
        let results: Vec<IngestResult> = results
            .into_iter()
            .zip(files)
            .map(|(r, path)| r.unwrap_or_else(|| IngestResult::not_attempted(path)))
            .collect();

        let outcome = match results
            .iter()
            .find(|r| r.stops_batch(config.on_failure))
        {
            Some(failed) => {
                let kind = failed.error_kind.unwrap_or(ErrorKind::Internal);
                let reason = failed.reason.clone().unwrap_or_default();
                error!(
                    "Batch aborted at {}: {} ({})",
                    failed.path.display(),
                    reason,
                    kind
                );
                BatchOutcome::Aborted {
                    path: failed.path.clone(),
                    kind,
                    reason,
                }
            }
            None if cancelled => BatchOutcome::Cancelled,
            None => BatchOutcome::Completed,
        };

        let mut report = IngestReport {
            instrument,
            policy: config.on_failure,
            dry_run: config.dry_run,
            outcome,
            results,
            visits: None,
            visit_error: None,
            started_at,
            finished_at: Utc::now(),
        };

        if let Some(visit_config) = config.define_visits {
            if !config.dry_run && report.outcome != BatchOutcome::Cancelled {
                self.define_visits(&mut report, visit_config).await;
            }
        }

        info!(
            "Batch finished: {} succeeded, {} failed, {} not attempted",
            report.count(FileState::Succeeded),
            report.count(FileState::Failed),
            report.count(FileState::NotAttempted)
        );
        report.finished_at = Utc::now();
        Ok(report)
    }

    async fn define_visits(
        &self,
        report: &mut IngestReport,
        visit_config: VisitDefinitionConfig,
    ) {
        let mut exposures: Vec<(String, i64)> = report
            .results
            .iter()
            .filter(|r| r.is_success())
            .filter_map(|r| r.exposure_id)
            .map(|id| (report.instrument.clone(), id))
            .collect();
        exposures.sort();
        exposures.dedup();
        if exposures.is_empty() {
            debug!("No committed exposures; skipping visit definition");
            return;
        }

        let registry = self.registry.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            VisitDefiner::new(registry.as_ref(), visit_config).run(&exposures)
        })
        .await
        .map_err(|e| Error::Internal(format!("visit definition task failed: {}", e)))
        .and_then(|r| r);

        match outcome {
            Ok(visits) => report.visits = Some(visits),
            Err(e) => {
                error!("Visit definition failed: {}", e);
                report.visit_error = Some(e.to_string());
            }
        }
    }
}

/// Run one file through the state machine. Never panics on bad input.
fn ingest_file(ctx: &BatchContext, path: PathBuf) -> IngestResult {
    let mut progress = FileProgress {
        stage: FileStage::Pending,
        exposure_id: None,
        detector: None,
    };

    match run_file(ctx, &path, &mut progress) {
        Ok(committed) => {
            if committed.duplicate {
                info!("{}: already registered, skipped", path.display());
            } else if ctx.config.dry_run {
                info!("{}: dry run, rolled back", path.display());
            } else {
                info!(
                    "{}: ingested exposure {:?} detector {:?}",
                    path.display(),
                    progress.exposure_id,
                    progress.detector
                );
            }
            IngestResult {
                path,
                state: FileState::Succeeded,
                stage: progress.stage,
                exposure_id: progress.exposure_id,
                detector: progress.detector,
                dataset_id: committed.dataset_id,
                duplicate: committed.duplicate,
                dry_run: ctx.config.dry_run,
                error_kind: None,
                reason: None,
            }
        }
        Err(e) => {
            warn!("{}: failed during {:?}: {}", path.display(), progress.stage, e);
            IngestResult {
                exposure_id: progress.exposure_id,
                detector: progress.detector,
                ..IngestResult::failed(path, progress.stage, &e)
            }
        }
    }
}

fn run_file(ctx: &BatchContext, path: &Path, progress: &mut FileProgress) -> Result<Committed> {
    let descriptor = ctx.resolver.descriptor();

    progress.enter(FileStage::Extracting, path);
    let mut file = File::open(path)?;
    let header = read_header(&mut file)?;
    let info = ctx
        .extractor
        .extract(&header, descriptor, &ctx.config.properties)?;
    progress.exposure_id = info.exposure_id;
    progress.detector = info.detector_num;

    progress.enter(FileStage::ResolvingDependencies, path);
    let resolved = ctx.resolver.resolve(ctx.registry.as_ref(), &info)?;

    progress.enter(FileStage::Building, path);
    let record = ExposureRecordBuilder::build(&info, &resolved, descriptor)?;

    file.seek(SeekFrom::Start(0))?;
    let digest = checksum(&mut file)?;

    progress.enter(FileStage::Committing, path);
    let tx = ctx.registry.begin()?;

    if tx.dataset_exists(&record.instrument, record.id, &record.detector)? {
        if ctx.config.strict_duplicates {
            return Err(Error::DuplicateExposure(format!(
                "{} exposure {} detector {} is already registered",
                record.instrument, record.id, record.detector
            )));
        }
        tx.rollback()?;
        return Ok(Committed {
            dataset_id: None,
            duplicate: true,
        });
    }

    let created = ctx.resolver.materialize(tx.as_ref(), &resolved)?;
    debug!(
        "{}: {} new dependency record(s)",
        path.display(),
        created.iter().filter(|o| o.inserted()).count()
    );

    if tx.insert_exposure(&record)? == ExposureInsert::Existing {
        debug!(
            "{}: exposure {} already present, adding detector",
            path.display(),
            record.id
        );
    }

    let association = RawDatasetAssociation {
        dataset_id: Uuid::new_v4().to_string(),
        instrument: record.instrument.clone(),
        exposure_id: record.id,
        detector: record.detector.clone(),
        location: location_of(path),
        checksum: Some(digest),
        ingested_at: Utc::now(),
    };
    tx.associate_dataset(&association)?;

    if ctx.config.dry_run {
        tx.rollback()?;
    } else {
        tx.commit()?;
    }
    Ok(Committed {
        dataset_id: Some(association.dataset_id),
        duplicate: false,
    })
}

fn location_of(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

/// SHA-256 of everything left in `reader`, hex encoded.
pub fn checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    io::copy(reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
