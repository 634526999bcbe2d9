//! MongoDB-backed datastore and GridFS bucket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::stream::StreamExt;
use mongodb::{
    gridfs::GridFsBucket,
    options::{ClientOptions, FindOptions, GridFsBucketOptions, ReplaceOptions, SelectionCriteria},
    Client, Collection, Database,
};
use tracing::debug;

use crate::backend::{
    ByteReader, ByteWriter, Datastore, FileRecordStream, GridFsBackend, UploadOptions,
};
use crate::error::{GridFsError, Result};
use crate::options::{BucketConfig, FindFilesOptions};
use crate::record::FileRecord;

/// Datastore over a MongoDB database handle.
#[derive(Debug, Clone)]
pub struct MongoDatastore {
    database: Database,
}

impl MongoDatastore {
    /// Wrap an existing database handle.
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Connect to MongoDB and select `database_name`.
    ///
    /// `timeout` bounds both connecting and server selection.
    pub async fn connect(
        connection_string: &str,
        database_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut options = ClientOptions::parse(connection_string).await?;
        if let Some(timeout) = timeout {
            options.connect_timeout = Some(timeout);
            options.server_selection_timeout = Some(timeout);
        }
        debug!("Creating MongoDB client for database '{}'", database_name);
        let client = Client::with_options(options)?;
        Ok(Self::new(client.database(database_name)))
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Share this datastore behind the [`Datastore`] trait.
    pub fn into_shared(self) -> Arc<dyn Datastore> {
        Arc::new(self)
    }
}

#[async_trait]
impl Datastore for MongoDatastore {
    fn is_connected(&self) -> bool {
        // The driver reconnects on demand; a Database handle never goes stale.
        true
    }

    fn open_bucket(&self, config: &BucketConfig) -> Result<Arc<dyn GridFsBackend>> {
        Ok(Arc::new(MongoBucket::new(&self.database, config)))
    }

    async fn save_document(&self, collection: &str, document: Document) -> Result<()> {
        let id = document.get("_id").cloned().ok_or(GridFsError::MissingId)?;
        let collection = self.database.collection::<Document>(collection);

        let mut options = ReplaceOptions::default();
        options.upsert = Some(true);
        collection
            .replace_one(doc! { "_id": id }, document)
            .with_options(options)
            .await?;
        Ok(())
    }

    async fn find_document(&self, collection: &str, filter: Document) -> Result<Option<Document>> {
        let collection = self.database.collection::<Document>(collection);
        Ok(collection.find_one(filter).await?)
    }
}

/// One GridFS bucket in a MongoDB database.
pub struct MongoBucket {
    name: String,
    bucket: GridFsBucket,
    files: Collection<FileRecord>,
    selection_criteria: SelectionCriteria,
}

impl MongoBucket {
    pub fn new(database: &Database, config: &BucketConfig) -> Self {
        let options = GridFsBucketOptions::builder()
            .bucket_name(Some(config.name.clone()))
            .chunk_size_bytes(config.chunk_size_bytes)
            .selection_criteria(Some(config.selection_criteria.clone()))
            .write_concern(config.write_concern.clone())
            .build();

        Self {
            name: config.name.clone(),
            bucket: database.gridfs_bucket(options),
            files: database.collection::<FileRecord>(&config.files_collection()),
            selection_criteria: config.selection_criteria.clone(),
        }
    }
}

#[async_trait]
impl GridFsBackend for MongoBucket {
    fn bucket_name(&self) -> &str {
        &self.name
    }

    async fn open_upload_stream(
        &self,
        filename: &str,
        options: UploadOptions,
    ) -> Result<ByteWriter> {
        let mut upload = self.bucket.open_upload_stream(filename).id(options.id);
        if let Some(chunk_size_bytes) = options.chunk_size_bytes {
            upload = upload.chunk_size_bytes(chunk_size_bytes);
        }
        if let Some(metadata) = options.metadata {
            upload = upload.metadata(metadata);
        }
        let stream = upload.await.map_err(GridFsError::from_driver)?;
        Ok(Box::pin(stream))
    }

    async fn open_download_stream(&self, id: Bson) -> Result<ByteReader> {
        let stream = self
            .bucket
            .open_download_stream(id)
            .await
            .map_err(GridFsError::from_driver)?;
        Ok(Box::pin(stream))
    }

    async fn open_download_stream_by_name(
        &self,
        filename: &str,
        revision: i32,
    ) -> Result<ByteReader> {
        let stream = self
            .bucket
            .open_download_stream_by_name(filename)
            .revision(revision)
            .await
            .map_err(GridFsError::from_driver)?;
        Ok(Box::pin(stream))
    }

    async fn delete(&self, id: Bson) -> Result<()> {
        self.bucket
            .delete(id)
            .await
            .map_err(GridFsError::from_driver)
    }

    async fn find(&self, filter: Document, options: FindFilesOptions) -> Result<FileRecordStream> {
        let mut find_options = FindOptions::default();
        find_options.sort = options.sort;
        find_options.skip = options.skip;
        find_options.limit = options.limit;
        find_options.selection_criteria = Some(self.selection_criteria.clone());

        let cursor = self
            .files
            .find(filter)
            .with_options(find_options)
            .await
            .map_err(GridFsError::from_driver)?;

        Ok(cursor
            .map(|record| record.map_err(GridFsError::from))
            .boxed())
    }

    async fn update_file(&self, id: &Bson, fields: Document) -> Result<()> {
        self.files
            .clone_with_type::<Document>()
            .update_one(doc! { "_id": id.clone() }, doc! { "$set": fields })
            .await?;
        Ok(())
    }
}
