use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum UploaderError {
    #[error("connection to LIMS failed: {0}")]
    Connection(String),

    #[error("authentication rejected by LIMS: {0}")]
    Authentication(String),

    #[error("LIMS returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("API contract mismatch: {0}")]
    Contract(String),

    #[error("upload canceled by user for sample {0}")]
    UploadCanceled(String),

    #[error("failed to read sequence file {path}: {message}")]
    FileIo { path: PathBuf, message: String },

    #[error("invalid sequencing run: {0}")]
    InvalidRun(String),

    #[error("invalid sample {name}: {message}")]
    InvalidSample { name: String, message: String },

    #[error("upload attempt rejected: {0}")]
    AttemptRejected(String),

    #[error("run is delayed until {0}")]
    RunDelayed(String),

    #[error("missing config file (searched {0})")]
    MissingConfig(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value for {field}: {message}")]
    ConfigValue { field: String, message: String },

    #[error("missing run manifest at {0}")]
    MissingManifest(PathBuf),

    #[error("failed to parse run manifest: {0}")]
    ManifestParse(String),

    #[error("failed to persist run status: {0}")]
    StatusWrite(String),

    #[error("failed to read run status file: {0}")]
    StatusRead(String),
}
