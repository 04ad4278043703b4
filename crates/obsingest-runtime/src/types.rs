//! Runtime types: per-file results and the batch report.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use obsingest_core::{Error, ErrorKind, FailurePolicy};
use obsingest_ingest::VisitReport;

/// Non-terminal stages of the per-file state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStage {
    Pending,
    Extracting,
    ResolvingDependencies,
    Building,
    Committing,
}

/// Terminal state of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Succeeded,
    Failed,
    /// Never dispatched because the batch was aborted or cancelled first.
    NotAttempted,
}

/// Outcome of one input file.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub path: PathBuf,
    pub state: FileState,
    /// Last stage entered before reaching `state`.
    pub stage: FileStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detector: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    /// The raw dataset was already registered; nothing was written.
    pub duplicate: bool,
    /// Everything ran but the transaction was rolled back.
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IngestResult {
    pub fn not_attempted(path: PathBuf) -> Self {
        Self {
            path,
            state: FileState::NotAttempted,
            stage: FileStage::Pending,
            exposure_id: None,
            detector: None,
            dataset_id: None,
            duplicate: false,
            dry_run: false,
            error_kind: None,
            reason: None,
        }
    }

    pub fn failed(path: PathBuf, stage: FileStage, error: &Error) -> Self {
        Self {
            state: FileState::Failed,
            stage,
            error_kind: Some(error.kind()),
            reason: Some(error.to_string()),
            ..Self::not_attempted(path)
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == FileState::Succeeded
    }

    pub fn is_failure(&self) -> bool {
        self.state == FileState::Failed
    }

    /// Whether this failure stops the batch under `policy`.
    pub fn stops_batch(&self, policy: FailurePolicy) -> bool {
        self.is_failure()
            && (policy == FailurePolicy::AbortBatch
                || self.error_kind.is_some_and(ErrorKind::is_batch_fatal))
    }
}

/// How the batch as a whole ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed,
    Aborted {
        path: PathBuf,
        kind: ErrorKind,
        reason: String,
    },
    Cancelled,
}

/// Batch-level report handed to the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub instrument: String,
    pub policy: FailurePolicy,
    pub dry_run: bool,
    pub outcome: BatchOutcome,
    /// One entry per input file, in input order.
    pub results: Vec<IngestResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visits: Option<VisitReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visit_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl IngestReport {
    pub fn count(&self, state: FileState) -> usize {
        self.results.iter().filter(|r| r.state == state).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &IngestResult> {
        self.results.iter().filter(|r| r.is_failure())
    }

    /// Exit status for the run.
    ///
    /// `abort-batch`: every file succeeded. `skip-and-continue`: the batch
    /// was not aborted by a batch-fatal error. A failed visit definition
    /// fails the run under either policy.
    pub fn exit_success(&self) -> bool {
        if self.visit_error.is_some() {
            return false;
        }
        match self.policy {
            FailurePolicy::AbortBatch => self.results.iter().all(IngestResult::is_success),
            FailurePolicy::SkipAndContinue => {
                !matches!(self.outcome, BatchOutcome::Aborted { .. })
            }
        }
    }
}

/// Cloneable cancellation flag, checked before each file is dispatched.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
