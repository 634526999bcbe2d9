//! Storage seams between the bucket adapter and a concrete driver.
//!
//! [`Datastore`] stands for one database connection: it hands out GridFS
//! backends and persists plain documents. [`GridFsBackend`] exposes the
//! driver's native upload/download/find/delete primitives for one bucket.
//!
//! Two implementations ship with this crate:
//! - [`crate::MongoDatastore`] - the MongoDB driver
//! - [`crate::MemoryDatastore`] - an in-process store with the same collection layout

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::io::{AsyncRead, AsyncWrite};
use futures::stream::BoxStream;

use crate::error::{GridFsError, Result};
use crate::options::{BucketConfig, FindFilesOptions};
use crate::record::FileRecord;

/// A boxed download stream.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// A boxed upload sink; closing it commits the file.
pub type ByteWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A stream of file records produced by a find.
pub type FileRecordStream = BoxStream<'static, Result<FileRecord>>;

/// Per-upload options passed to a backend.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub id: Bson,
    pub chunk_size_bytes: Option<u32>,
    pub metadata: Option<Document>,
}

/// One database connection.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Whether the underlying connection is usable.
    fn is_connected(&self) -> bool;

    /// Open the GridFS bucket described by `config`.
    fn open_bucket(&self, config: &BucketConfig) -> Result<Arc<dyn GridFsBackend>>;

    /// Insert or replace `document` in `collection`, matching on `_id`.
    async fn save_document(&self, collection: &str, document: Document) -> Result<()>;

    /// Find one document in `collection`.
    async fn find_document(&self, collection: &str, filter: Document) -> Result<Option<Document>>;
}

/// Native primitives of one GridFS bucket.
#[async_trait]
pub trait GridFsBackend: Send + Sync {
    /// Name of the bucket.
    fn bucket_name(&self) -> &str;

    /// Open an upload stream. Data is committed when the stream is closed.
    async fn open_upload_stream(&self, filename: &str, options: UploadOptions)
        -> Result<ByteWriter>;

    /// Open a download stream for the file with the given id.
    async fn open_download_stream(&self, id: Bson) -> Result<ByteReader>;

    /// Open a download stream for a revision of the named file.
    ///
    /// `0` is the oldest revision, `-1` the newest.
    async fn open_download_stream_by_name(&self, filename: &str, revision: i32)
        -> Result<ByteReader>;

    /// Delete a file record and its chunks.
    async fn delete(&self, id: Bson) -> Result<()>;

    /// Find file records matching `filter`.
    async fn find(&self, filter: Document, options: FindFilesOptions) -> Result<FileRecordStream>;

    /// Set extra top-level fields (`contentType`, `aliases`) on a file record.
    async fn update_file(&self, id: &Bson, fields: Document) -> Result<()>;
}

/// A named collection and, when connected, the datastore it lives in.
///
/// This is the handle document-mapped records carry; buckets and record
/// persistence are derived from it.
#[derive(Clone)]
pub struct CollectionRef {
    name: String,
    datastore: Option<Arc<dyn Datastore>>,
}

impl CollectionRef {
    /// A collection bound to a live datastore.
    pub fn new(name: impl Into<String>, datastore: Arc<dyn Datastore>) -> Self {
        Self {
            name: name.into(),
            datastore: Some(datastore),
        }
    }

    /// A collection with no database handle. Any bucket derivation fails.
    pub fn detached(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datastore: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The datastore, or [`GridFsError::NotConnected`] if there is no live one.
    pub fn datastore(&self) -> Result<&Arc<dyn Datastore>> {
        match &self.datastore {
            Some(datastore) if datastore.is_connected() => Ok(datastore),
            _ => Err(GridFsError::NotConnected),
        }
    }

    /// Persist `document` into this collection.
    pub async fn save_document(&self, document: Document) -> Result<()> {
        self.datastore()?.save_document(&self.name, document).await
    }

    /// Find one document in this collection.
    pub async fn find_document(&self, filter: Document) -> Result<Option<Document>> {
        self.datastore()?.find_document(&self.name, filter).await
    }
}

impl fmt::Debug for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionRef")
            .field("name", &self.name)
            .field("connected", &self.datastore().is_ok())
            .finish()
    }
}
