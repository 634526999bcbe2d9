//! Attach one GridFS file to each record of a mapped collection.

use std::fmt;

use bson::{doc, Bson, Document};
use futures::io::AsyncRead;
use gridfs_bucket::{
    id_to_string, Bucket, BucketOptions, FileRecord, FindFilesOptions, GridFsError, ReadOptions,
    ReadStream, Result, WriteOptions,
};
use tracing::{debug, info};

use crate::naming::NameSource;
use crate::record::MappedRecord;

pub const DEFAULT_FILE_ID_FIELD: &str = "fileId";
pub const DEFAULT_FILENAME_FIELD: &str = "filename";

/// Field that makes a file share its record's identifier.
pub const RECORD_ID_FIELD: &str = "_id";

/// How records locate their bucket, filename and file reference.
pub struct AttachmentOptions<R> {
    pub bucket_options: BucketOptions,
    /// Overrides `bucket_options.bucket_name` per record when it resolves.
    pub bucket_name: Option<NameSource<R>>,
    /// Record field holding the file id.
    pub file_id: String,
    pub filename: NameSource<R>,
}

impl<R: MappedRecord + 'static> Default for AttachmentOptions<R> {
    fn default() -> Self {
        Self {
            bucket_options: BucketOptions::default(),
            bucket_name: None,
            file_id: DEFAULT_FILE_ID_FIELD.to_string(),
            filename: NameSource::field(DEFAULT_FILENAME_FIELD),
        }
    }
}

impl<R: MappedRecord + 'static> AttachmentOptions<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket_options(mut self, options: BucketOptions) -> Self {
        self.bucket_options = options;
        self
    }

    pub fn with_bucket_name(mut self, name: impl Into<NameSource<R>>) -> Self {
        self.bucket_name = Some(name.into());
        self
    }

    pub fn with_file_id(mut self, field: impl Into<String>) -> Self {
        self.file_id = field.into();
        self
    }

    pub fn with_filename(mut self, filename: impl Into<NameSource<R>>) -> Self {
        self.filename = filename.into();
        self
    }
}

impl<R> Clone for AttachmentOptions<R> {
    fn clone(&self) -> Self {
        Self {
            bucket_options: self.bucket_options.clone(),
            bucket_name: self.bucket_name.clone(),
            file_id: self.file_id.clone(),
            filename: self.filename.clone(),
        }
    }
}

impl<R> fmt::Debug for AttachmentOptions<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentOptions")
            .field("bucket_options", &self.bucket_options)
            .field("bucket_name", &self.bucket_name)
            .field("file_id", &self.file_id)
            .field("filename", &self.filename)
            .finish()
    }
}

/// Per-write upload settings.
#[derive(Debug, Clone, Default)]
pub struct AttachmentWriteOptions {
    /// Replaces the configured filename for this write.
    pub filename: Option<String>,
    pub metadata: Option<Document>,
    pub content_type: Option<String>,
    pub aliases: Option<Vec<String>>,
    pub chunk_size_bytes: Option<u32>,
}

impl AttachmentWriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Document) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// File attachment behavior for records of type `R`.
///
/// Each record references at most one file, through the `file_id` field.
/// With `file_id` set to `"_id"` the file is stored under the record's own
/// identifier, and a second write for the same record is rejected by the
/// storage layer as a duplicate key.
pub struct GridFsAttachment<R> {
    options: AttachmentOptions<R>,
}

impl<R: MappedRecord + 'static> GridFsAttachment<R> {
    pub fn new(options: AttachmentOptions<R>) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &AttachmentOptions<R> {
        &self.options
    }

    fn shares_record_id(&self) -> bool {
        self.options.file_id == RECORD_ID_FIELD
    }

    /// The bucket `record`'s file lives in.
    pub fn bucket_for(&self, record: &R) -> Result<Bucket> {
        let mut options = self.options.bucket_options.clone();
        if let Some(name) = self
            .options
            .bucket_name
            .as_ref()
            .and_then(|source| source.resolve(record))
        {
            options.bucket_name = Some(name);
        }
        let datastore = record.collection().datastore()?;
        Bucket::create(datastore.as_ref(), &options)
    }

    /// Filename to store `record`'s file under; `<id>.file` when none resolves.
    pub fn gridfs_filename(&self, record: &R) -> Result<String> {
        if let Some(filename) = self.options.filename.resolve(record) {
            return Ok(filename);
        }
        let id = record.id().ok_or(GridFsError::MissingId)?;
        Ok(format!("{}.file", id_to_string(&id)))
    }

    /// The referenced file id, if `record` has one.
    pub fn file_id(&self, record: &R) -> Option<Bson> {
        record.get(&self.options.file_id)
    }

    fn write_options(&self, record: &R, options: AttachmentWriteOptions) -> Result<WriteOptions> {
        let filename = match options.filename {
            Some(filename) => filename,
            None => self.gridfs_filename(record)?,
        };
        let mut write = WriteOptions::new(filename);
        if self.shares_record_id() {
            write.id = Some(record.id().ok_or(GridFsError::MissingId)?);
        }
        write.metadata = options.metadata;
        write.content_type = options.content_type;
        write.aliases = options.aliases;
        write.chunk_size_bytes = options.chunk_size_bytes;
        Ok(write)
    }

    /// Store `source` as `record`'s file and point the record at it.
    pub async fn write<S>(
        &self,
        record: &mut R,
        source: S,
        options: AttachmentWriteOptions,
    ) -> Result<FileRecord>
    where
        S: AsyncRead + Unpin + Send,
    {
        let bucket = self.bucket_for(record)?;
        let write = self.write_options(record, options)?;
        let file = bucket.write_file(write, source).await?;
        self.reference(record, &file).await?;
        Ok(file)
    }

    pub async fn write_bytes(
        &self,
        record: &mut R,
        data: &[u8],
        options: AttachmentWriteOptions,
    ) -> Result<FileRecord> {
        let bucket = self.bucket_for(record)?;
        let write = self.write_options(record, options)?;
        let file = bucket.write_bytes(write, data).await?;
        self.reference(record, &file).await?;
        Ok(file)
    }

    async fn reference(&self, record: &mut R, file: &FileRecord) -> Result<()> {
        if self.shares_record_id() {
            return Ok(());
        }
        record.set(&self.options.file_id, file.id.clone());
        record.save().await?;
        debug!(
            "Referenced file {} from '{}.{}'",
            id_to_string(&file.id),
            record.collection().name(),
            self.options.file_id
        );
        Ok(())
    }

    fn read_options(&self, record: &R) -> Result<ReadOptions> {
        match self.file_id(record) {
            Some(id) => Ok(ReadOptions::by_id(id)),
            None => Ok(ReadOptions::by_filename(self.gridfs_filename(record)?)),
        }
    }

    /// Stream `record`'s file: by reference when set, else the latest revision
    /// of its filename.
    pub async fn create_read_stream(&self, record: &R) -> Result<ReadStream> {
        let options = self.read_options(record)?;
        self.bucket_for(record)?.create_read_stream(options).await
    }

    pub async fn read(&self, record: &R) -> Result<Vec<u8>> {
        let options = self.read_options(record)?;
        self.bucket_for(record)?.read_file(options).await
    }

    /// The stored file record for `record`, if any.
    pub async fn file_record(&self, record: &R) -> Result<Option<FileRecord>> {
        let bucket = self.bucket_for(record)?;
        match self.file_id(record) {
            Some(id) => bucket.find_by_id(id).await,
            None => {
                bucket
                    .find_one(
                        doc! { "filename": self.gridfs_filename(record)? },
                        FindFilesOptions::new().with_sort(doc! { "uploadDate": -1, "_id": -1 }),
                    )
                    .await
            }
        }
    }

    /// Delete `record`'s file and clear its reference.
    ///
    /// Returns the deleted id, or `None` when nothing was referenced.
    pub async fn unlink(&self, record: &mut R) -> Result<Option<Bson>> {
        let Some(id) = self.file_id(record) else {
            return Ok(None);
        };
        let deleted = self.bucket_for(record)?.delete_by_id(id).await?;
        if !self.shares_record_id() {
            record.set(&self.options.file_id, Bson::Null);
            record.save().await?;
        }
        info!(
            "Unlinked file {} from a '{}' record",
            id_to_string(&deleted),
            record.collection().name()
        );
        Ok(Some(deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DocumentRecord;
    use gridfs_bucket::{CollectionRef, MemoryDatastore};

    fn users(store: &MemoryDatastore) -> CollectionRef {
        CollectionRef::new("users", store.shared())
    }

    #[tokio::test]
    async fn test_write_sets_reference_and_saves() {
        let store = MemoryDatastore::new();
        let attachment = GridFsAttachment::new(AttachmentOptions::new());
        let mut user = DocumentRecord::new(users(&store), doc! { "filename": "cv.pdf" });

        let file = attachment
            .write_bytes(&mut user, b"%PDF", AttachmentWriteOptions::new())
            .await
            .unwrap();

        assert_eq!(file.filename, "cv.pdf");
        assert_eq!(user.get("fileId"), Some(file.id.clone()));
        let saved = store.documents("users");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].get("fileId"), Some(&file.id));
        assert_eq!(attachment.read(&user).await.unwrap(), b"%PDF");
    }

    #[tokio::test]
    async fn test_filename_falls_back_to_record_id() {
        let attachment = GridFsAttachment::new(AttachmentOptions::new());
        let user = DocumentRecord::new(CollectionRef::detached("users"), doc! {});
        let id = user.id().unwrap();
        assert_eq!(
            attachment.gridfs_filename(&user).unwrap(),
            format!("{}.file", id_to_string(&id))
        );
    }

    #[tokio::test]
    async fn test_record_id_as_file_id_rejects_second_write() {
        let store = MemoryDatastore::new();
        let attachment = GridFsAttachment::new(AttachmentOptions::new().with_file_id("_id"));
        let mut user = DocumentRecord::new(users(&store), doc! {});
        let id = user.id().unwrap();

        let file = attachment
            .write_bytes(&mut user, b"first", AttachmentWriteOptions::new())
            .await
            .unwrap();
        assert_eq!(file.id, id);
        assert!(store.documents("users").is_empty());

        let err = attachment
            .write_bytes(&mut user, b"second", AttachmentWriteOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert!(err.to_string().contains(&id_to_string(&id)));
    }

    #[tokio::test]
    async fn test_bucket_name_from_record() {
        let store = MemoryDatastore::new();
        let attachment = GridFsAttachment::new(
            AttachmentOptions::new().with_bucket_name(NameSource::field("kind")),
        );
        let mut user = DocumentRecord::new(users(&store), doc! { "kind": "avatars" });
        attachment
            .write_bytes(&mut user, b"png", AttachmentWriteOptions::new())
            .await
            .unwrap();

        assert_eq!(attachment.bucket_for(&user).unwrap().name(), "avatars");
        assert_eq!(store.count_documents("avatars.files", &doc! {}), 1);
        assert_eq!(store.count_documents("fs.files", &doc! {}), 0);
    }

    #[tokio::test]
    async fn test_read_by_filename_without_reference() {
        let store = MemoryDatastore::new();
        let attachment = GridFsAttachment::<DocumentRecord>::new(
            AttachmentOptions::new().with_filename("shared.txt"),
        );
        let bucket = Bucket::create(&store, &BucketOptions::new()).unwrap();
        bucket
            .write_bytes(WriteOptions::new("shared.txt"), b"v1")
            .await
            .unwrap();
        bucket
            .write_bytes(WriteOptions::new("shared.txt"), b"v22")
            .await
            .unwrap();

        let user = DocumentRecord::new(users(&store), doc! {});
        assert_eq!(attachment.read(&user).await.unwrap(), b"v22");
        let record = attachment.file_record(&user).await.unwrap().unwrap();
        assert_eq!(record.length, 3);
    }

    #[tokio::test]
    async fn test_unlink_clears_reference() {
        let store = MemoryDatastore::new();
        let attachment = GridFsAttachment::new(AttachmentOptions::new());
        let mut user = DocumentRecord::new(users(&store), doc! { "filename": "a.txt" });
        let file = attachment
            .write_bytes(&mut user, b"a", AttachmentWriteOptions::new())
            .await
            .unwrap();

        let deleted = attachment.unlink(&mut user).await.unwrap();
        assert_eq!(deleted, Some(file.id));
        assert_eq!(user.get("fileId"), None);
        assert_eq!(store.count_documents("fs.files", &doc! {}), 0);
        assert_eq!(attachment.unlink(&mut user).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_detached_record_is_not_connected() {
        let attachment = GridFsAttachment::new(AttachmentOptions::new());
        let mut user = DocumentRecord::new(CollectionRef::detached("users"), doc! {});
        let err = attachment
            .write_bytes(&mut user, b"x", AttachmentWriteOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GridFsError::NotConnected));
    }
}
