//! Storage engine for multipart upload handlers.
//!
//! An upload handler hands each incoming file part to an [`UploadStorage`],
//! which stores it and returns a [`StoredFileDescriptor`] the handler attaches
//! to the request. [`GridFsUploadStorage`] streams parts straight into a bucket.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use futures::io::AsyncRead;
use gridfs_bucket::{id_to_string, Bucket, FileRecord, Result, WriteOptions};
use serde::Serialize;
use tracing::{debug, info};

/// Describes one file part of an incoming upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFileInfo {
    /// Form field the file was sent under.
    pub field_name: String,
    /// Filename as given by the client.
    pub original_name: String,
    pub mime_type: String,
}

/// A file part and its content stream.
pub struct IncomingFile {
    pub info: IncomingFileInfo,
    pub stream: Pin<Box<dyn AsyncRead + Send>>,
}

impl IncomingFile {
    pub fn new<S>(info: IncomingFileInfo, stream: S) -> Self
    where
        S: AsyncRead + Send + 'static,
    {
        Self {
            info,
            stream: Box::pin(stream),
        }
    }
}

impl fmt::Debug for IncomingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingFile")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// What an upload handler learns about a stored file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFileDescriptor {
    pub id: Bson,
    pub filename: String,
    pub original_name: String,
    pub field_name: String,
    pub size: i64,
    pub chunk_size: i32,
    pub upload_date: DateTime<Utc>,
    pub content_type: Option<String>,
    pub bucket_name: String,
    pub metadata: Option<Document>,
}

impl StoredFileDescriptor {
    fn from_record(record: FileRecord, info: IncomingFileInfo, bucket_name: &str) -> Self {
        Self {
            id: record.id,
            filename: record.filename,
            original_name: info.original_name,
            field_name: info.field_name,
            size: record.length,
            chunk_size: record.chunk_size,
            upload_date: record.upload_date.to_chrono(),
            content_type: record.content_type,
            bucket_name: bucket_name.to_string(),
            metadata: record.metadata,
        }
    }
}

/// Pluggable storage for uploaded files.
#[async_trait]
pub trait UploadStorage<Req>: Send + Sync
where
    Req: Send + Sync,
{
    /// Store one incoming file.
    async fn handle_file(&self, request: &Req, file: IncomingFile) -> Result<StoredFileDescriptor>;

    /// Remove a file previously stored by `handle_file`, e.g. when the rest of
    /// the request fails.
    async fn remove_file(&self, request: &Req, file: &StoredFileDescriptor) -> Result<()>;
}

pub type FilenameFn<Req> = Arc<dyn Fn(&Req, &IncomingFileInfo) -> String + Send + Sync>;
pub type MetadataFn<Req> = Arc<dyn Fn(&Req, &IncomingFileInfo) -> Option<Document> + Send + Sync>;

/// Upload storage that writes every file part into one GridFS bucket.
pub struct GridFsUploadStorage<Req> {
    bucket: Bucket,
    filename: Option<FilenameFn<Req>>,
    metadata: Option<MetadataFn<Req>>,
}

impl<Req> GridFsUploadStorage<Req> {
    /// Files are stored under their original name unless a filename function is set.
    pub fn new(bucket: Bucket) -> Self {
        Self {
            bucket,
            filename: None,
            metadata: None,
        }
    }

    pub fn with_filename<F>(mut self, filename: F) -> Self
    where
        F: Fn(&Req, &IncomingFileInfo) -> String + Send + Sync + 'static,
    {
        self.filename = Some(Arc::new(filename));
        self
    }

    pub fn with_metadata<F>(mut self, metadata: F) -> Self
    where
        F: Fn(&Req, &IncomingFileInfo) -> Option<Document> + Send + Sync + 'static,
    {
        self.metadata = Some(Arc::new(metadata));
        self
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    fn write_options(&self, request: &Req, info: &IncomingFileInfo) -> WriteOptions {
        let filename = match &self.filename {
            Some(filename) => filename(request, info),
            None => info.original_name.clone(),
        };
        let mut options = WriteOptions::new(filename).with_content_type(&info.mime_type);
        if let Some(metadata) = self.metadata.as_ref().and_then(|f| f(request, info)) {
            options = options.with_metadata(metadata);
        }
        options
    }
}

#[async_trait]
impl<Req> UploadStorage<Req> for GridFsUploadStorage<Req>
where
    Req: Send + Sync,
{
    async fn handle_file(&self, request: &Req, file: IncomingFile) -> Result<StoredFileDescriptor> {
        let IncomingFile { info, stream } = file;
        let options = self.write_options(request, &info);
        debug!(
            "Storing upload field '{}' ('{}') as '{}'",
            info.field_name, info.original_name, options.filename
        );
        let record = self.bucket.write_file(options, stream).await?;
        Ok(StoredFileDescriptor::from_record(
            record,
            info,
            self.bucket.name(),
        ))
    }

    async fn remove_file(&self, _request: &Req, file: &StoredFileDescriptor) -> Result<()> {
        self.bucket.delete_by_id(file.id.clone()).await?;
        info!(
            "Removed uploaded file {} from bucket '{}'",
            id_to_string(&file.id),
            file.bucket_name
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use gridfs_bucket::{BucketOptions, MemoryDatastore, ReadOptions};

    struct Request {
        user: String,
    }

    fn info(original_name: &str) -> IncomingFileInfo {
        IncomingFileInfo {
            field_name: "document".to_string(),
            original_name: original_name.to_string(),
            mime_type: "text/plain".to_string(),
        }
    }

    #[tokio::test]
    async fn test_stores_under_original_name() {
        let store = MemoryDatastore::new();
        let bucket = Bucket::create(&store, &BucketOptions::new().with_bucket_name("uploads")).unwrap();
        let storage = GridFsUploadStorage::<Request>::new(bucket.clone());
        let request = Request { user: "ada".into() };

        let stored = storage
            .handle_file(&request, IncomingFile::new(info("notes.txt"), &b"hello"[..]))
            .await
            .unwrap();

        assert_eq!(stored.filename, "notes.txt");
        assert_eq!(stored.original_name, "notes.txt");
        assert_eq!(stored.field_name, "document");
        assert_eq!(stored.size, 5);
        assert!(stored.chunk_size > 0);
        assert_eq!(stored.content_type.as_deref(), Some("text/plain"));
        assert_eq!(stored.bucket_name, "uploads");
        assert_eq!(stored.metadata, None);

        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["originalName"], "notes.txt");
        assert_eq!(json["fieldName"], "document");
        assert_eq!(json["bucketName"], "uploads");
        assert!(json.get("uploadDate").is_some());

        let data = bucket.read_file(ReadOptions::by_id(stored.id)).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_filename_and_metadata_functions() {
        let store = MemoryDatastore::new();
        let bucket = Bucket::create(&store, &BucketOptions::new()).unwrap();
        let storage = GridFsUploadStorage::new(bucket)
            .with_filename(|request: &Request, info| format!("{}/{}", request.user, info.original_name))
            .with_metadata(|request: &Request, _| Some(doc! { "owner": request.user.clone() }));
        let request = Request { user: "grace".into() };

        let stored = storage
            .handle_file(&request, IncomingFile::new(info("cv.txt"), &b"cv"[..]))
            .await
            .unwrap();

        assert_eq!(stored.filename, "grace/cv.txt");
        assert_eq!(stored.original_name, "cv.txt");
        assert_eq!(stored.metadata, Some(doc! { "owner": "grace" }));
    }

    #[tokio::test]
    async fn test_remove_file() {
        let store = MemoryDatastore::new();
        let bucket = Bucket::create(&store, &BucketOptions::new()).unwrap();
        let storage = GridFsUploadStorage::<Request>::new(bucket);
        let request = Request { user: "ada".into() };

        let stored = storage
            .handle_file(&request, IncomingFile::new(info("tmp.txt"), &b"tmp"[..]))
            .await
            .unwrap();
        assert_eq!(store.count_documents("fs.files", &doc! {}), 1);

        storage.remove_file(&request, &stored).await.unwrap();
        assert_eq!(store.count_documents("fs.files", &doc! {}), 0);
        assert_eq!(store.count_documents("fs.chunks", &doc! {}), 0);

        let err = storage.remove_file(&request, &stored).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
