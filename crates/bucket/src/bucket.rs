//! The bucket adapter.

use std::fmt;
use std::sync::Arc;

use bson::{doc, oid::ObjectId, Bson, Document};
use futures::io::{AsyncRead, AsyncWriteExt};
use futures::TryStreamExt;
use tracing::{debug, info, warn};

use crate::backend::{CollectionRef, Datastore, GridFsBackend, UploadOptions};
use crate::error::{GridFsError, Result};
use crate::options::{
    bucket_name_from_collection, chunks_collection_name, files_collection_name, BucketOptions,
    FindFilesOptions, ReadOptions, WriteOptions,
};
use crate::record::{id_to_string, FileRecord};
use crate::stream::{ReadStream, WriteStream};

/// A GridFS bucket bound to one datastore connection.
///
/// Cheap to clone; clones share the same backend handle.
#[derive(Clone)]
pub struct Bucket {
    backend: Arc<dyn GridFsBackend>,
}

impl Bucket {
    /// Open a bucket on `datastore`.
    ///
    /// The name is the explicit `bucket_name` or else `default_bucket_name`.
    pub fn create(datastore: &dyn Datastore, options: &BucketOptions) -> Result<Self> {
        Self::open(datastore, options, None)
    }

    /// Open the bucket whose files collection is `collection`.
    ///
    /// The bucket name is derived from the collection name (`attachments.files`
    /// gives `attachments`) unless `options` names one explicitly.
    pub fn from_collection(collection: &CollectionRef, options: &BucketOptions) -> Result<Self> {
        let datastore = collection.datastore()?;
        let derived = bucket_name_from_collection(collection.name());
        Self::open(datastore.as_ref(), options, Some(derived))
    }

    /// Wrap an already-open backend.
    pub fn from_backend(backend: Arc<dyn GridFsBackend>) -> Self {
        Self { backend }
    }

    fn open(
        datastore: &dyn Datastore,
        options: &BucketOptions,
        derived_name: Option<&str>,
    ) -> Result<Self> {
        if !datastore.is_connected() {
            return Err(GridFsError::NotConnected);
        }
        let config = options.resolve(derived_name)?;
        let backend = datastore.open_bucket(&config)?;
        info!("Opened GridFS bucket '{}'", config.name);
        Ok(Self { backend })
    }

    pub fn name(&self) -> &str {
        self.backend.bucket_name()
    }

    /// `<bucket>.files`
    pub fn files_collection_name(&self) -> String {
        files_collection_name(self.name())
    }

    /// `<bucket>.chunks`
    pub fn chunks_collection_name(&self) -> String {
        chunks_collection_name(self.name())
    }

    /// Open a download stream selected by id, or by filename and revision.
    pub async fn create_read_stream(&self, options: ReadOptions) -> Result<ReadStream> {
        options.validate()?;
        let inner = if let Some(id) = &options.id {
            debug!("Opening download of {} from '{}'", id_to_string(id), self.name());
            self.backend.open_download_stream(id.clone()).await?
        } else {
            let filename = options.filename.as_deref().unwrap_or_default();
            let revision = options.revision.unwrap_or(-1);
            debug!(
                "Opening download of '{}' (revision {}) from '{}'",
                filename,
                revision,
                self.name()
            );
            self.backend
                .open_download_stream_by_name(filename, revision)
                .await?
        };
        ReadStream::new(inner, options.start, options.end).await
    }

    /// Open an upload stream. An `ObjectId` is generated when no id is given.
    pub async fn create_write_stream(&self, options: WriteOptions) -> Result<WriteStream> {
        options.validate()?;
        let WriteOptions {
            filename,
            id,
            metadata,
            content_type,
            aliases,
            chunk_size_bytes,
        } = options;
        let id = id.unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));

        let mut extra_fields = Document::new();
        if let Some(content_type) = content_type {
            extra_fields.insert("contentType", content_type);
        }
        if let Some(aliases) = aliases {
            extra_fields.insert("aliases", aliases);
        }

        debug!(
            "Opening upload of '{}' as {} into '{}'",
            filename,
            id_to_string(&id),
            self.name()
        );
        let inner = self
            .backend
            .open_upload_stream(
                &filename,
                UploadOptions {
                    id: id.clone(),
                    chunk_size_bytes,
                    metadata,
                },
            )
            .await?;
        Ok(WriteStream::new(
            inner,
            self.backend.clone(),
            id,
            filename,
            extra_fields,
        ))
    }

    /// Pipe `source` into a new file and return its record.
    pub async fn write_file<R>(&self, options: WriteOptions, source: R) -> Result<FileRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut stream = self.create_write_stream(options).await?;
        futures::io::copy(source, &mut stream).await?;
        stream.finish().await
    }

    /// Store `data` as a new file and return its record.
    pub async fn write_bytes(&self, options: WriteOptions, data: &[u8]) -> Result<FileRecord> {
        let mut stream = self.create_write_stream(options).await?;
        stream.write_all(data).await?;
        stream.finish().await
    }

    /// Read a whole file (or the requested range) into memory.
    pub async fn read_file(&self, options: ReadOptions) -> Result<Vec<u8>> {
        self.create_read_stream(options).await?.read_to_vec().await
    }

    /// Delete a file and its chunks, returning the deleted id.
    pub async fn delete_by_id(&self, id: impl Into<Bson>) -> Result<Bson> {
        let id = id.into();
        self.backend.delete(id.clone()).await?;
        info!("Deleted {} from bucket '{}'", id_to_string(&id), self.name());
        Ok(id)
    }

    /// Delete every file record named `filename`, returning the deleted ids.
    ///
    /// Deletion stops at the first failure; files deleted before it stay deleted.
    pub async fn delete_by_filename(
        &self,
        filename: &str,
        options: FindFilesOptions,
    ) -> Result<Vec<Bson>> {
        let mut records = self
            .backend
            .find(doc! { "filename": filename }, options)
            .await?;

        let mut deleted = Vec::new();
        while let Some(record) = records.try_next().await? {
            if let Err(e) = self.backend.delete(record.id.clone()).await {
                warn!(
                    "Aborting delete of '{}' in '{}' after {} file(s): {}",
                    filename,
                    self.name(),
                    deleted.len(),
                    e
                );
                return Err(e);
            }
            deleted.push(record.id);
        }

        info!(
            "Deleted {} file(s) named '{}' from bucket '{}'",
            deleted.len(),
            filename,
            self.name()
        );
        Ok(deleted)
    }

    /// Look up a file record by id.
    pub async fn find_by_id(&self, id: impl Into<Bson>) -> Result<Option<FileRecord>> {
        self.find_one(doc! { "_id": id.into() }, FindFilesOptions::new())
            .await
    }

    /// First file record matching `filter`.
    pub async fn find_one(
        &self,
        filter: Document,
        options: FindFilesOptions,
    ) -> Result<Option<FileRecord>> {
        let options = FindFilesOptions {
            limit: Some(1),
            ..options
        };
        let mut records = self.backend.find(filter, options).await?;
        records.try_next().await
    }

    /// All file records matching `filter`.
    pub async fn find(&self, filter: Document, options: FindFilesOptions) -> Result<Vec<FileRecord>> {
        self.backend.find(filter, options).await?.try_collect().await
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket").field("name", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use async_trait::async_trait;

    use crate::backend::{ByteReader, ByteWriter, FileRecordStream};
    use crate::MemoryDatastore;

    fn bucket() -> (MemoryDatastore, Bucket) {
        let store = MemoryDatastore::new();
        let bucket = Bucket::create(&store, &BucketOptions::new()).unwrap();
        (store, bucket)
    }

    #[tokio::test]
    async fn test_write_then_read_by_id() {
        let (_store, bucket) = bucket();
        let record = bucket
            .write_bytes(WriteOptions::new("hello.txt"), b"hello gridfs")
            .await
            .unwrap();

        assert_eq!(record.filename, "hello.txt");
        assert_eq!(record.length, 12);
        let data = bucket.read_file(ReadOptions::by_id(record.id)).await.unwrap();
        assert_eq!(data, b"hello gridfs");
    }

    #[tokio::test]
    async fn test_write_requires_filename() {
        let (_store, bucket) = bucket();
        let err = bucket
            .write_bytes(WriteOptions::new(""), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, GridFsError::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn test_read_requires_id_or_filename() {
        let (_store, bucket) = bucket();
        let err = bucket.read_file(ReadOptions::default()).await.unwrap_err();
        assert!(matches!(err, GridFsError::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn test_write_stream_synthesizes_id_and_sets_extras() {
        let (store, bucket) = bucket();
        let mut stream = bucket
            .create_write_stream(
                WriteOptions::new("report.csv")
                    .with_content_type("text/csv")
                    .with_aliases(vec!["latest.csv".to_string()]),
            )
            .await
            .unwrap();
        assert!(matches!(stream.id(), Bson::ObjectId(_)));
        assert_eq!(stream.filename(), "report.csv");

        stream.write_all(b"a,b\n1,2\n").await.unwrap();
        let record = stream.finish().await.unwrap();

        assert_eq!(record.content_type.as_deref(), Some("text/csv"));
        assert_eq!(record.aliases, Some(vec!["latest.csv".to_string()]));
        assert_eq!(store.count_documents("fs.files", &doc! {}), 1);
        assert_eq!(store.count_documents("fs.chunks", &doc! {}), 1);
    }

    #[tokio::test]
    async fn test_small_chunks_are_reassembled() {
        let store = MemoryDatastore::new();
        let bucket = Bucket::create(
            &store,
            &BucketOptions::new()
                .with_bucket_name("tiny")
                .with_chunk_size_bytes(4),
        )
        .unwrap();

        let record = bucket
            .write_bytes(WriteOptions::new("abc.txt"), b"abcdefghij")
            .await
            .unwrap();
        assert_eq!(record.chunk_size, 4);
        assert_eq!(store.count_documents("tiny.chunks", &doc! {}), 3);

        let data = bucket.read_file(ReadOptions::by_id(record.id)).await.unwrap();
        assert_eq!(data, b"abcdefghij");
    }

    #[tokio::test]
    async fn test_find_one_returns_none_when_absent() {
        let (_store, bucket) = bucket();
        assert!(bucket.find_by_id(ObjectId::new()).await.unwrap().is_none());
        assert!(bucket
            .find_one(doc! { "filename": "nope" }, FindFilesOptions::new())
            .await
            .unwrap()
            .is_none());
    }

    /// Delegates to an in-memory bucket but fails the nth delete.
    struct FailingDeletes {
        inner: Arc<dyn GridFsBackend>,
        fail_on: usize,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl GridFsBackend for FailingDeletes {
        fn bucket_name(&self) -> &str {
            self.inner.bucket_name()
        }

        async fn open_upload_stream(
            &self,
            filename: &str,
            options: UploadOptions,
        ) -> Result<ByteWriter> {
            self.inner.open_upload_stream(filename, options).await
        }

        async fn open_download_stream(&self, id: Bson) -> Result<ByteReader> {
            self.inner.open_download_stream(id).await
        }

        async fn open_download_stream_by_name(
            &self,
            filename: &str,
            revision: i32,
        ) -> Result<ByteReader> {
            self.inner.open_download_stream_by_name(filename, revision).await
        }

        async fn delete(&self, id: Bson) -> Result<()> {
            if self.deletes.fetch_add(1, AtomicOrdering::SeqCst) + 1 == self.fail_on {
                return Err(GridFsError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                )));
            }
            self.inner.delete(id).await
        }

        async fn find(
            &self,
            filter: Document,
            options: FindFilesOptions,
        ) -> Result<FileRecordStream> {
            self.inner.find(filter, options).await
        }

        async fn update_file(&self, id: &Bson, fields: Document) -> Result<()> {
            self.inner.update_file(id, fields).await
        }
    }

    #[tokio::test]
    async fn test_delete_by_filename_stops_at_first_failure() {
        let store = MemoryDatastore::new();
        let config = BucketOptions::new().resolve(None).unwrap();
        let bucket = Bucket::from_backend(Arc::new(FailingDeletes {
            inner: store.open_bucket(&config).unwrap(),
            fail_on: 2,
            deletes: AtomicUsize::new(0),
        }));

        let mut ids = Vec::new();
        for body in ["one", "two", "three"] {
            let record = bucket
                .write_bytes(WriteOptions::new("batch.txt"), body.as_bytes())
                .await
                .unwrap();
            ids.push(record.id);
        }

        let err = bucket
            .delete_by_filename(
                "batch.txt",
                FindFilesOptions::new().with_sort(doc! { "uploadDate": 1, "_id": 1 }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GridFsError::Io(_)));

        assert!(bucket.find_by_id(ids[0].clone()).await.unwrap().is_none());
        assert!(bucket.find_by_id(ids[1].clone()).await.unwrap().is_some());
        assert_eq!(
            bucket.read_file(ReadOptions::by_id(ids[2].clone())).await.unwrap(),
            b"three"
        );
        assert_eq!(store.count_documents("fs.files", &doc! {}), 2);
    }

    #[tokio::test]
    async fn test_create_rejects_disconnected_datastore() {
        let store = MemoryDatastore::new();
        store.disconnect();
        let err = Bucket::create(&store, &BucketOptions::new()).unwrap_err();
        assert!(matches!(err, GridFsError::NotConnected));
    }
}
