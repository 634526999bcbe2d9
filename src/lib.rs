//! gridfs-kit
//!
//! GridFS storage for MongoDB applications, in three layers:
//!
//! - [`gridfs_bucket`]: the bucket adapter (default naming, async stream and
//!   buffer reads/writes, lookups and deletes)
//! - [`gridfs_model`]: files-collection records with content operations, and
//!   file attachments for any document-mapped record type
//! - [`upload`]: a storage engine for multipart upload handlers
//!
//! [`config`] and [`logging`] hold the connection settings and subscriber
//! setup an embedding application needs.
//!
//! # Example
//!
//! ```ignore
//! use gridfs_kit::{config, Bucket, ReadOptions, WriteOptions};
//!
//! let datastore = config::connect(&opts).await?;
//! let bucket = Bucket::create(&datastore, &opts.bucket_options())?;
//! let record = bucket.write_bytes(WriteOptions::new("a.txt"), b"abc").await?;
//! let data = bucket.read_file(ReadOptions::by_id(record.id)).await?;
//! ```

pub mod config;
pub mod logging;
pub mod upload;

pub use gridfs_bucket;
pub use gridfs_model;

pub use config::{connect, ConnectOpts};
pub use gridfs_bucket::{
    Bucket, BucketOptions, CollectionRef, Datastore, FileRecord, FindFilesOptions, GridFsError,
    MemoryDatastore, MongoDatastore, ReadOptions, ReadStream, Result, WriteOptions, WriteStream,
};
pub use gridfs_model::{
    AttachmentOptions, AttachmentWriteOptions, DocumentRecord, GridFile, GridFileModel,
    GridFsAttachment, MappedRecord, NameSource,
};
pub use logging::init_logging;
pub use upload::{
    GridFsUploadStorage, IncomingFile, IncomingFileInfo, StoredFileDescriptor, UploadStorage,
};
