use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PulseError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {0}")]
    Status(u16),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("timed out after {0}ms")]
    Timeout(u64),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("offline database error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type PulseResult<T> = Result<T, PulseError>;

/// Rejection of a single upstream pod record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has no node identity key")]
    MissingKey,
}
