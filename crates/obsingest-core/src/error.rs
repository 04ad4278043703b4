//! Error types for obsingest.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Record build error: {0}")]
    RecordBuild(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("Duplicate exposure: {0}")]
    DuplicateExposure(String),

    #[error("Conflicting definition: {0}")]
    ConflictingDefinition(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Serialisable classification of an [`Error`], used in ingest reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Extraction,
    Resolution,
    RecordBuild,
    ForeignKeyViolation,
    UnknownInstrument,
    DuplicateExposure,
    ConflictingDefinition,
    Database,
    Config,
    Io,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Extraction => "ExtractionError",
            Self::Resolution => "ResolutionError",
            Self::RecordBuild => "RecordBuildError",
            Self::ForeignKeyViolation => "ForeignKeyViolation",
            Self::UnknownInstrument => "UnknownInstrumentError",
            Self::DuplicateExposure => "DuplicateExposure",
            Self::ConflictingDefinition => "ConflictingDefinition",
            Self::Database => "DatabaseError",
            Self::Config => "ConfigError",
            Self::Io => "IoError",
            Self::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Extraction(_) => ErrorKind::Extraction,
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::RecordBuild(_) => ErrorKind::RecordBuild,
            Self::ForeignKeyViolation(_) => ErrorKind::ForeignKeyViolation,
            Self::UnknownInstrument(_) => ErrorKind::UnknownInstrument,
            Self::DuplicateExposure(_) => ErrorKind::DuplicateExposure,
            Self::ConflictingDefinition(_) => ErrorKind::ConflictingDefinition,
            Self::Database(_) => ErrorKind::Database,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            // A malformed JSON payload is bad input for that file.
            Self::Json(_) => ErrorKind::Extraction,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error aborts the whole batch regardless of the failure policy.
    ///
    /// These indicate a defect or an unusable environment rather than bad input data.
    pub fn is_batch_fatal(&self) -> bool {
        self.kind().is_batch_fatal()
    }
}

impl ErrorKind {
    pub fn is_batch_fatal(self) -> bool {
        matches!(
            self,
            Self::RecordBuild | Self::UnknownInstrument | Self::Config | Self::Database | Self::Internal
        )
    }
}
