use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PrepError {
    #[error("configuration error: {0}")]
    #[diagnostic(help("check the update-prep config file"))]
    Config(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("{0}")]
    State(String),

    #[error("corrupted head bag for id={aipid}: {path}: {reason}")]
    CorruptedBag {
        aipid: String,
        path: Utf8PathBuf,
        reason: String,
    },

    #[error("invalid NERDm record {path}: {reason}")]
    InvalidRecord { path: Utf8PathBuf, reason: String },

    #[error("distribution service request failed: {0}")]
    DistribHttp(String),

    #[error("distribution service returned status {status}: {message}")]
    DistribStatus { status: u16, message: String },

    #[error("metadata service request failed: {0}")]
    MetadataHttp(String),

    #[error("metadata service returned status {status}: {message}")]
    MetadataStatus { status: u16, message: String },

    #[error("unsupported checksum algorithm for {name}: {algorithm}")]
    UnsupportedChecksum { name: String, algorithm: String },

    #[error("unrecognized version source label: {0}")]
    UnknownVersionSource(String),

    #[error("invalid dataset identifier: {0}")]
    InvalidAipId(String),

    #[error("JSON error in {path}: {message}")]
    Json { path: Utf8PathBuf, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("operation interrupted while building {0}")]
    Interrupted(Utf8PathBuf),
}

impl PrepError {
    pub(crate) fn fs(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        PrepError::Filesystem(format!("{context}: {err}"))
    }

    pub(crate) fn json(path: &camino::Utf8Path, err: serde_json::Error) -> Self {
        PrepError::Json {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}
