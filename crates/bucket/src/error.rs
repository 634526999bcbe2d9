//! Error types for GridFS bucket operations.

use mongodb::error::{ErrorKind, GridFsErrorKind, InsertManyError, WriteFailure};
use thiserror::Error;

/// Server error code for a duplicate key on a unique index.
pub const DUPLICATE_KEY_CODE: i32 = 11000;

/// Errors that can occur while working with a GridFS bucket.
#[derive(Error, Debug)]
pub enum GridFsError {
    /// No live database handle backs the collection or datastore.
    #[error("Not connected: no live database handle is available")]
    NotConnected,

    /// Caller-supplied options are incomplete or inconsistent.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// The files collection could not be used for the requested operation.
    #[error("Invalid collection '{collection}': {reason}")]
    InvalidCollection { collection: String, reason: String },

    /// A write reused a key that already exists (raised by the in-memory backend).
    #[error("E11000 duplicate key error collection: {collection} dup key: {key}")]
    DuplicateKey { collection: String, key: String },

    /// No file matched the requested identifier, filename or revision.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// The record has no `_id` to derive a filename or file id from.
    #[error("Record has no _id")]
    MissingId,

    /// MongoDB driver error, forwarded verbatim.
    #[error("MongoDB error: {0}")]
    MongoDB(#[from] mongodb::error::Error),

    /// Stream-level I/O error.
    #[error("IO error: {0}")]
    Io(std::io::Error),

    /// BSON serialization error.
    #[error("BSON serialization error: {0}")]
    Serialization(#[from] bson::ser::Error),

    /// BSON deserialization error.
    #[error("BSON deserialization error: {0}")]
    Deserialization(#[from] bson::de::Error),
}

impl GridFsError {
    /// Whether this error is a duplicate-key failure from the storage layer,
    /// either the in-memory variant or a driver write error with code 11000.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            GridFsError::DuplicateKey { .. } => true,
            GridFsError::MongoDB(err) => is_driver_duplicate_key(err),
            _ => false,
        }
    }

    /// Whether this error reports a missing file or revision.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GridFsError::FileNotFound(_))
    }

    /// Map the driver's GridFS "not found" kinds onto [`GridFsError::FileNotFound`],
    /// forwarding everything else unchanged.
    pub(crate) fn from_driver(err: mongodb::error::Error) -> Self {
        match err.kind.as_ref() {
            ErrorKind::GridFs(GridFsErrorKind::FileNotFound { identifier, .. }) => {
                GridFsError::FileNotFound(format!("{identifier:?}"))
            }
            ErrorKind::GridFs(GridFsErrorKind::RevisionNotFound { revision, .. }) => {
                GridFsError::FileNotFound(format!("revision {revision}"))
            }
            _ => GridFsError::MongoDB(err),
        }
    }
}

fn is_driver_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY_CODE
        }
        ErrorKind::InsertMany(InsertManyError {
            write_errors: Some(write_errors),
            ..
        }) => write_errors
            .iter()
            .any(|write_error| write_error.code == DUPLICATE_KEY_CODE),
        ErrorKind::GridFs(GridFsErrorKind::AbortError {
            original_error: Some(original),
            ..
        }) => is_driver_duplicate_key(original),
        _ => false,
    }
}

/// Unwraps a bucket or driver error carried inside an `io::Error` so that
/// stream failures surface with their original kind.
impl From<std::io::Error> for GridFsError {
    fn from(err: std::io::Error) -> Self {
        let carries_inner = err
            .get_ref()
            .map(|inner| inner.is::<GridFsError>() || inner.is::<mongodb::error::Error>())
            .unwrap_or(false);
        if !carries_inner {
            return GridFsError::Io(err);
        }

        let kind = err.kind();
        match err.into_inner() {
            Some(inner) => match inner.downcast::<GridFsError>() {
                Ok(bucket_err) => *bucket_err,
                Err(inner) => match inner.downcast::<mongodb::error::Error>() {
                    Ok(driver_err) => GridFsError::from_driver(*driver_err),
                    Err(other) => GridFsError::Io(std::io::Error::new(kind, other)),
                },
            },
            None => GridFsError::Io(std::io::Error::from(kind)),
        }
    }
}

/// Result alias for bucket operations.
pub type Result<T> = std::result::Result<T, GridFsError>;
