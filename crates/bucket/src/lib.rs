//! GridFS bucket adapter
//!
//! Wraps a GridFS bucket with default naming, async stream and buffer
//! reads/writes, and id- or name-based lookup and deletion. Chunking, chunk
//! integrity and the on-disk layout stay with the storage driver behind the
//! [`GridFsBackend`] seam.
//!
//! # Example
//!
//! ```ignore
//! use gridfs_bucket::{Bucket, BucketOptions, MongoDatastore, ReadOptions, WriteOptions};
//!
//! let datastore = MongoDatastore::connect("mongodb://localhost:27017", "app", None).await?;
//! let bucket = Bucket::create(&datastore, &BucketOptions::new())?;
//!
//! let record = bucket.write_bytes(WriteOptions::new("hello.txt"), b"hello").await?;
//! let data = bucket.read_file(ReadOptions::by_id(record.id.clone())).await?;
//! bucket.delete_by_id(record.id).await?;
//! ```

mod backend;
mod bucket;
mod error;
mod memory;
mod mongo;
mod options;
pub mod path;
mod record;
mod stream;

pub use backend::{
    ByteReader, ByteWriter, CollectionRef, Datastore, FileRecordStream, GridFsBackend,
    UploadOptions,
};
pub use bucket::Bucket;
pub use error::{GridFsError, Result, DUPLICATE_KEY_CODE};
pub use memory::{MemoryBucket, MemoryDatastore};
pub use mongo::{MongoBucket, MongoDatastore};
pub use options::{
    bucket_name_from_collection, chunks_collection_name, files_collection_name, BucketConfig,
    BucketOptions, FindFilesOptions, ReadOptions, WriteOptions, DEFAULT_BUCKET_NAME,
    DEFAULT_CHUNK_SIZE_BYTES,
};
pub use record::{id_to_string, FileRecord};
pub use stream::{ReadStream, WriteStream};
