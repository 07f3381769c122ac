use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by datasource construction, record parsing, and the
/// spatial index. Construction failures are fatal; per-record failures are
/// logged and skipped unless the datasource was opened with `strict`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no such file: {}", .0.display())]
    NoSuchFile(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unknown datasource type '{0}'")]
    UnknownBackend(String),

    #[error("missing required parameter '{0}'")]
    MissingParam(String),

    #[error("invalid value for parameter '{key}': {reason}")]
    InvalidParam { key: String, reason: String },

    #[error("malformed record at byte {offset}: {reason} near '{excerpt}'")]
    MalformedRecord {
        offset: u64,
        reason: String,
        excerpt: String,
    },

    #[error("malformed file: {0}")]
    MalformedFile(String),

    #[error("could not detect a geometry column named wkt, geojson, x/y, or longitude/latitude")]
    NoGeometryColumn,

    #[error("expected a column header at line {line}, column {column}")]
    MissingHeader { line: usize, column: usize },

    #[error("corrupt spatial index: {0}")]
    CorruptIndex(String),

    #[error("unsupported geometry: {0}")]
    UnsupportedGeometry(String),

    #[error("unknown attribute '{0}'")]
    UnknownAttribute(String),
}

impl Error {
    /// Build a `MalformedRecord` carrying a bounded excerpt of the bytes
    /// around the failure so the caller can locate it in the source file.
    pub fn malformed_record(offset: u64, reason: impl Into<String>, context: &[u8]) -> Self {
        let window = &context[..context.len().min(200)];
        Error::MalformedRecord {
            offset,
            reason: reason.into(),
            excerpt: String::from_utf8_lossy(window).into_owned(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
