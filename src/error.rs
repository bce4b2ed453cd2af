use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ArchiveError {
    #[error("invalid satellite: {0}")]
    InvalidSatellite(String),

    #[error("invalid product: {0}")]
    InvalidProduct(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid scan range: start {start} is after end {end}")]
    InvalidRange { start: String, end: String },

    #[error("interval must be a positive number of minutes")]
    InvalidInterval,

    #[error("schedule undetectable: {0}")]
    ScheduleUndetectable(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("cache already closed")]
    CacheClosed,

    #[error("remote object not found: {0}")]
    RemoteNotFound(String),

    #[error("remote request failed (transient): {0}")]
    RemoteTransient(String),

    #[error("remote request failed: {message}")]
    RemotePermanent {
        status: Option<u16>,
        message: String,
    },

    #[error("local write failed: {0}")]
    LocalWrite(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("missing config file sat-archive.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("operation cancelled")]
    Cancelled,
}
