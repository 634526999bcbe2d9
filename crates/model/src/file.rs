//! Files collection records that know how to read and write their content.

use std::sync::Arc;

use bson::{doc, oid::ObjectId, Bson, DateTime, Document};
use futures::io::AsyncRead;
use gridfs_bucket::{
    bucket_name_from_collection, files_collection_name, id_to_string, Bucket, BucketOptions,
    CollectionRef, Datastore, FileRecord, FindFilesOptions, GridFsError, ReadOptions, ReadStream,
    Result, WriteOptions, WriteStream,
};
use tracing::debug;

/// The model bound to one `<bucket>.files` collection.
///
/// Its bucket is always derived from the collection name, so saved records
/// and their content live in the same bucket.
#[derive(Debug, Clone)]
pub struct GridFileModel {
    collection: CollectionRef,
    bucket_options: BucketOptions,
}

impl GridFileModel {
    /// Fails with [`GridFsError::InvalidCollection`] unless the collection is
    /// named `<bucket>.files`.
    pub fn new(collection: CollectionRef) -> Result<Self> {
        let name = collection.name();
        let bucket_name = bucket_name_from_collection(name);
        if bucket_name == name || bucket_name.is_empty() {
            return Err(GridFsError::InvalidCollection {
                collection: name.to_string(),
                reason: "a file model needs a '<bucket>.files' collection".to_string(),
            });
        }
        Ok(Self {
            collection,
            bucket_options: BucketOptions::default(),
        })
    }

    /// Model over `<bucket_name>.files` in `datastore`.
    pub fn for_bucket(datastore: Arc<dyn Datastore>, bucket_name: &str) -> Result<Self> {
        Self::new(CollectionRef::new(
            files_collection_name(bucket_name),
            datastore,
        ))
    }

    /// Options applied when deriving the bucket (chunk size, read preference).
    /// Any bucket name in `options` is ignored.
    pub fn with_bucket_options(mut self, options: BucketOptions) -> Self {
        self.bucket_options = BucketOptions {
            bucket_name: None,
            ..options
        };
        self
    }

    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    /// The bucket behind this model's collection.
    pub fn get_bucket(&self) -> Result<Bucket> {
        let options = BucketOptions {
            bucket_name: None,
            ..self.bucket_options.clone()
        };
        Bucket::from_collection(&self.collection, &options)
    }

    /// A new, not yet written file with a fresh `ObjectId`.
    pub fn new_file(&self, filename: impl Into<String>) -> GridFile {
        GridFile {
            model: self.clone(),
            id: Bson::ObjectId(ObjectId::new()),
            filename: filename.into(),
            content_type: None,
            aliases: None,
            metadata: None,
            length: None,
            chunk_size: None,
            upload_date: None,
            md5: None,
        }
    }

    /// Wrap a stored file record.
    pub fn hydrate(&self, record: FileRecord) -> GridFile {
        let mut file = self.new_file(record.filename.clone());
        file.apply(record);
        file
    }

    pub async fn find_by_id(&self, id: impl Into<Bson>) -> Result<Option<GridFile>> {
        let record = self.get_bucket()?.find_by_id(id).await?;
        Ok(record.map(|record| self.hydrate(record)))
    }

    pub async fn find(&self, filter: Document, options: FindFilesOptions) -> Result<Vec<GridFile>> {
        let records = self.get_bucket()?.find(filter, options).await?;
        Ok(records.into_iter().map(|record| self.hydrate(record)).collect())
    }

    /// Write `source` as the content of `file` and return it updated.
    pub async fn write<S>(&self, mut file: GridFile, source: S) -> Result<GridFile>
    where
        S: AsyncRead + Unpin + Send,
    {
        file.write(source).await?;
        Ok(file)
    }

    pub async fn read(&self, options: ReadOptions) -> Result<Vec<u8>> {
        self.get_bucket()?.read_file(options).await
    }

    pub async fn create_read_stream(&self, options: ReadOptions) -> Result<ReadStream> {
        self.get_bucket()?.create_read_stream(options).await
    }

    pub async fn create_write_stream(&self, options: WriteOptions) -> Result<WriteStream> {
        self.get_bucket()?.create_write_stream(options).await
    }

    pub async fn delete_by_id(&self, id: impl Into<Bson>) -> Result<Bson> {
        self.get_bucket()?.delete_by_id(id).await
    }

    pub async fn delete_by_filename(&self, filename: &str) -> Result<Vec<Bson>> {
        self.get_bucket()?
            .delete_by_filename(filename, FindFilesOptions::new())
            .await
    }
}

/// One file record with its content operations.
///
/// Fields set before writing (`filename`, `content_type`, `aliases`,
/// `metadata`) are passed to the upload. The stored length, chunk size,
/// upload date and checksum are filled in once the write completes.
#[derive(Debug, Clone)]
pub struct GridFile {
    model: GridFileModel,
    pub id: Bson,
    pub filename: String,
    pub content_type: Option<String>,
    pub aliases: Option<Vec<String>>,
    pub metadata: Option<Document>,
    pub length: Option<i64>,
    pub chunk_size: Option<i32>,
    pub upload_date: Option<DateTime>,
    pub md5: Option<String>,
}

impl GridFile {
    pub fn model(&self) -> &GridFileModel {
        &self.model
    }

    pub fn get_bucket(&self) -> Result<Bucket> {
        self.model.get_bucket()
    }

    /// Whether content has been stored for this record.
    pub fn is_written(&self) -> bool {
        self.upload_date.is_some()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Document) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_aliases(mut self, aliases: Vec<String>) -> Self {
        self.aliases = Some(aliases);
        self
    }

    fn write_options(&self) -> WriteOptions {
        WriteOptions {
            filename: self.filename.clone(),
            id: Some(self.id.clone()),
            metadata: self.metadata.clone(),
            content_type: self.content_type.clone(),
            aliases: self.aliases.clone(),
            chunk_size_bytes: None,
        }
    }

    fn apply(&mut self, record: FileRecord) {
        self.id = record.id;
        self.filename = record.filename;
        self.length = Some(record.length);
        self.chunk_size = Some(record.chunk_size);
        self.upload_date = Some(record.upload_date);
        self.md5 = record.md5;
        if record.content_type.is_some() {
            self.content_type = record.content_type;
        }
        if record.aliases.is_some() {
            self.aliases = record.aliases;
        }
        if record.metadata.is_some() {
            self.metadata = record.metadata;
        }
    }

    /// Upload stream for this record's id and descriptive fields.
    ///
    /// Finishing the stream stores the content but does not update `self`;
    /// use [`GridFile::write`] for that.
    pub async fn create_write_stream(&self) -> Result<WriteStream> {
        self.get_bucket()?
            .create_write_stream(self.write_options())
            .await
    }

    pub async fn create_read_stream(&self) -> Result<ReadStream> {
        self.get_bucket()?
            .create_read_stream(ReadOptions::by_id(self.id.clone()))
            .await
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        self.get_bucket()?
            .read_file(ReadOptions::by_id(self.id.clone()))
            .await
    }

    /// Store `source` as this record's content, then save the record.
    pub async fn write<S>(&mut self, source: S) -> Result<()>
    where
        S: AsyncRead + Unpin + Send,
    {
        let record = self
            .get_bucket()?
            .write_file(self.write_options(), source)
            .await?;
        self.stored(record).await
    }

    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let record = self
            .get_bucket()?
            .write_bytes(self.write_options(), data)
            .await?;
        self.stored(record).await
    }

    async fn stored(&mut self, record: FileRecord) -> Result<()> {
        self.apply(record);
        self.save().await?;
        debug!(
            "Saved file record {} in '{}'",
            id_to_string(&self.id),
            self.model.collection.name()
        );
        Ok(())
    }

    /// Delete this record's content and the record itself.
    ///
    /// The stored fields are cleared, so the file reads as unwritten again.
    pub async fn unlink(&mut self) -> Result<Bson> {
        let id = self.get_bucket()?.delete_by_id(self.id.clone()).await?;
        self.length = None;
        self.chunk_size = None;
        self.upload_date = None;
        self.md5 = None;
        Ok(id)
    }

    /// Persist the record into the files collection.
    pub async fn save(&self) -> Result<()> {
        self.model
            .collection
            .save_document(self.to_document()?)
            .await
    }

    /// Stored record form, available once written.
    pub fn to_record(&self) -> Option<FileRecord> {
        Some(FileRecord {
            id: self.id.clone(),
            filename: self.filename.clone(),
            length: self.length?,
            chunk_size: self.chunk_size?,
            upload_date: self.upload_date?,
            metadata: self.metadata.clone(),
            aliases: self.aliases.clone(),
            content_type: self.content_type.clone(),
            md5: self.md5.clone(),
        })
    }

    pub fn to_document(&self) -> Result<Document> {
        if let Some(record) = self.to_record() {
            return record.to_document();
        }
        let mut document = doc! { "_id": self.id.clone(), "filename": self.filename.clone() };
        if let Some(content_type) = &self.content_type {
            document.insert("contentType", content_type);
        }
        if let Some(aliases) = &self.aliases {
            document.insert("aliases", aliases.clone());
        }
        if let Some(metadata) = &self.metadata {
            document.insert("metadata", metadata.clone());
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridfs_bucket::MemoryDatastore;

    fn model() -> (MemoryDatastore, GridFileModel) {
        let store = MemoryDatastore::new();
        let model = GridFileModel::for_bucket(store.shared(), "attachments").unwrap();
        (store, model)
    }

    #[tokio::test]
    async fn test_bucket_derived_from_collection() {
        let (_store, model) = model();
        assert_eq!(model.collection().name(), "attachments.files");
        assert_eq!(model.get_bucket().unwrap().name(), "attachments");
    }

    #[tokio::test]
    async fn test_write_fills_stored_fields() {
        let (store, model) = model();
        let mut file = model
            .new_file("notes.txt")
            .with_content_type("text/plain")
            .with_metadata(doc! { "owner": "ada" });
        assert!(!file.is_written());

        file.write_bytes(b"some notes").await.unwrap();

        assert!(file.is_written());
        assert_eq!(file.length, Some(10));
        assert!(file.chunk_size.is_some());
        assert_eq!(file.content_type.as_deref(), Some("text/plain"));
        assert_eq!(file.read().await.unwrap(), b"some notes");

        let stored = store.documents("attachments.files");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].get_str("contentType").unwrap(), "text/plain");
        assert_eq!(stored[0].get_document("metadata").unwrap(), &doc! { "owner": "ada" });
    }

    #[tokio::test]
    async fn test_find_and_unlink() {
        let (store, model) = model();
        let mut file = model.new_file("a.bin");
        file.write_bytes(&[1, 2, 3]).await.unwrap();

        let found = model.find_by_id(file.id.clone()).await.unwrap().unwrap();
        assert_eq!(found.filename, "a.bin");
        assert_eq!(found.length, Some(3));

        assert!(file.is_written());
        file.unlink().await.unwrap();
        assert!(!file.is_written());
        assert_eq!(file.length, None);
        assert_eq!(file.chunk_size, None);
        assert!(file.to_record().is_none());
        assert!(model.find_by_id(file.id.clone()).await.unwrap().is_none());
        assert_eq!(store.count_documents("attachments.chunks", &doc! {}), 0);

        let err = file.read().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_model_write_and_delete_by_filename() {
        let (_store, model) = model();
        for body in [b"one".as_slice(), b"two".as_slice()] {
            model.write(model.new_file("dup.txt"), body).await.unwrap();
        }
        assert_eq!(
            model.find(doc! { "filename": "dup.txt" }, FindFilesOptions::new()).await.unwrap().len(),
            2
        );

        let deleted = model.delete_by_filename("dup.txt").await.unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(model
            .find(doc! { "filename": "dup.txt" }, FindFilesOptions::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_detached_model_is_not_connected() {
        let model = GridFileModel::new(CollectionRef::detached("fs.files")).unwrap();
        let err = model.get_bucket().unwrap_err();
        assert!(matches!(err, GridFsError::NotConnected));
    }

    #[test]
    fn test_rejects_non_files_collection() {
        let store = MemoryDatastore::new();
        for name in ["attachments", ".files", "attachments.chunks"] {
            let err = GridFileModel::new(CollectionRef::new(name, store.shared())).unwrap_err();
            assert!(matches!(err, GridFsError::InvalidCollection { .. }), "{name}");
        }
        assert!(GridFileModel::for_bucket(store.shared(), "").is_err());
    }

    #[tokio::test]
    async fn test_bucket_name_option_cannot_move_content() {
        let (store, model) = model();
        let model = model.with_bucket_options(
            BucketOptions::new()
                .with_bucket_name("other")
                .with_chunk_size_bytes(4),
        );
        assert_eq!(model.get_bucket().unwrap().name(), "attachments");

        let mut file = model.new_file("moved.txt");
        file.write_bytes(b"stays put").await.unwrap();
        assert_eq!(file.chunk_size, Some(4));
        assert_eq!(store.count_documents("attachments.files", &doc! {}), 1);
        assert_eq!(store.count_documents("other.files", &doc! {}), 0);

        file.unlink().await.unwrap();
        assert_eq!(store.count_documents("attachments.files", &doc! {}), 0);
        assert_eq!(store.count_documents("attachments.chunks", &doc! {}), 0);
        assert!(!file.is_written());
    }
}
