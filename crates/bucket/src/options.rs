//! Option types for bucket creation, reads, writes and lookups.

use bson::{Bson, Document};
use mongodb::options::{ReadPreference, SelectionCriteria, WriteConcern};

use crate::error::{GridFsError, Result};

/// Bucket name used when neither an explicit name nor a collection name is available.
pub const DEFAULT_BUCKET_NAME: &str = "fs";

/// Chunk size GridFS uses when none is configured (255 KiB).
pub const DEFAULT_CHUNK_SIZE_BYTES: u32 = 255 * 1024;

/// Suffix of the files collection backing a bucket.
pub const FILES_COLLECTION_SUFFIX: &str = ".files";

/// Suffix of the chunks collection backing a bucket.
pub const CHUNKS_COLLECTION_SUFFIX: &str = ".chunks";

/// Options for creating a [`crate::Bucket`].
#[derive(Debug, Clone)]
pub struct BucketOptions {
    /// Explicit bucket name. Takes precedence over any derived name.
    pub bucket_name: Option<String>,

    /// Name used when no explicit or derived name is available.
    pub default_bucket_name: String,

    /// Chunk size for new uploads; the driver default applies when `None`.
    pub chunk_size_bytes: Option<u32>,

    /// Read preference for downloads and lookups.
    ///
    /// Defaults to primary-preferred when `None`.
    pub selection_criteria: Option<SelectionCriteria>,

    /// Write concern for uploads and deletes.
    pub write_concern: Option<WriteConcern>,
}

impl Default for BucketOptions {
    fn default() -> Self {
        Self {
            bucket_name: None,
            default_bucket_name: DEFAULT_BUCKET_NAME.to_string(),
            chunk_size_bytes: None,
            selection_criteria: None,
            write_concern: None,
        }
    }
}

impl BucketOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an explicit bucket name.
    pub fn with_bucket_name(mut self, name: impl Into<String>) -> Self {
        self.bucket_name = Some(name.into());
        self
    }

    /// Replace the fallback bucket name.
    pub fn with_default_bucket_name(mut self, name: impl Into<String>) -> Self {
        self.default_bucket_name = name.into();
        self
    }

    /// Set the chunk size for new uploads.
    pub fn with_chunk_size_bytes(mut self, chunk_size_bytes: u32) -> Self {
        self.chunk_size_bytes = Some(chunk_size_bytes);
        self
    }

    /// Override the read preference.
    pub fn with_selection_criteria(mut self, criteria: SelectionCriteria) -> Self {
        self.selection_criteria = Some(criteria);
        self
    }

    /// Set the write concern.
    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = Some(write_concern);
        self
    }

    /// Resolve the effective configuration.
    ///
    /// The name is, in order: the explicit `bucket_name`, the `derived_name`
    /// (usually taken from a collection), then `default_bucket_name`.
    pub fn resolve(&self, derived_name: Option<&str>) -> Result<BucketConfig> {
        let name = self
            .bucket_name
            .as_deref()
            .or(derived_name)
            .unwrap_or(&self.default_bucket_name)
            .to_string();
        validate_bucket_name(&name)?;

        Ok(BucketConfig {
            name,
            chunk_size_bytes: self.chunk_size_bytes,
            selection_criteria: self
                .selection_criteria
                .clone()
                .unwrap_or_else(primary_preferred),
            write_concern: self.write_concern.clone(),
        })
    }
}

/// Fully resolved bucket configuration handed to a [`crate::Datastore`].
#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub name: String,
    pub chunk_size_bytes: Option<u32>,
    pub selection_criteria: SelectionCriteria,
    pub write_concern: Option<WriteConcern>,
}

impl BucketConfig {
    /// Name of the files collection, `<bucket>.files`.
    pub fn files_collection(&self) -> String {
        files_collection_name(&self.name)
    }

    /// Name of the chunks collection, `<bucket>.chunks`.
    pub fn chunks_collection(&self) -> String {
        chunks_collection_name(&self.name)
    }
}

/// `<bucket>.files`
pub fn files_collection_name(bucket_name: &str) -> String {
    format!("{bucket_name}{FILES_COLLECTION_SUFFIX}")
}

/// `<bucket>.chunks`
pub fn chunks_collection_name(bucket_name: &str) -> String {
    format!("{bucket_name}{CHUNKS_COLLECTION_SUFFIX}")
}

/// Derive a bucket name from a collection name by stripping a trailing `.files`.
pub fn bucket_name_from_collection(collection_name: &str) -> &str {
    collection_name
        .strip_suffix(FILES_COLLECTION_SUFFIX)
        .unwrap_or(collection_name)
}

fn primary_preferred() -> SelectionCriteria {
    SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred { options: None })
}

fn validate_bucket_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(GridFsError::InvalidCollection {
            collection: files_collection_name(name),
            reason: "bucket name cannot be empty".to_string(),
        });
    }
    if name.contains('$') || name.contains('\0') {
        return Err(GridFsError::InvalidCollection {
            collection: files_collection_name(name),
            reason: "bucket name cannot contain '$' or NUL".to_string(),
        });
    }
    Ok(())
}

/// Options for opening a read stream.
///
/// Exactly one of `id` or `filename` selects the file; `id` wins if both are set.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub id: Option<Bson>,
    pub filename: Option<String>,
    /// Revision among files sharing `filename`: `0` is the oldest, `-1` the newest.
    pub revision: Option<i32>,
    /// First byte to return (inclusive).
    pub start: Option<u64>,
    /// Byte offset to stop at (exclusive).
    pub end: Option<u64>,
}

impl ReadOptions {
    /// Select a file by identifier.
    pub fn by_id(id: impl Into<Bson>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// Select the newest revision of a file by name.
    pub fn by_filename(filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            ..Default::default()
        }
    }

    pub fn with_revision(mut self, revision: i32) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Restrict the read to `start..end`.
    pub fn with_range(mut self, start: Option<u64>, end: Option<u64>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let has_filename = self.filename.as_deref().is_some_and(|f| !f.is_empty());
        if self.id.is_none() && !has_filename {
            return Err(GridFsError::InvalidOptions(
                "either an id or a filename is required to read a file".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(GridFsError::InvalidOptions(format!(
                    "range start {start} is past range end {end}"
                )));
            }
        }
        Ok(())
    }
}

/// Options for opening a write stream.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Required, non-empty.
    pub filename: String,
    /// File identifier; an `ObjectId` is generated when `None`.
    pub id: Option<Bson>,
    pub metadata: Option<Document>,
    pub content_type: Option<String>,
    pub aliases: Option<Vec<String>>,
    /// Overrides the bucket's chunk size for this upload.
    pub chunk_size_bytes: Option<u32>,
}

impl WriteOptions {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<Bson>) -> Self {
        self.id = Some(id.into());
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

    pub fn with_aliases(mut self, aliases: Vec<String>) -> Self {
        self.aliases = Some(aliases);
        self
    }

    pub fn with_chunk_size_bytes(mut self, chunk_size_bytes: u32) -> Self {
        self.chunk_size_bytes = Some(chunk_size_bytes);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.filename.is_empty() {
            return Err(GridFsError::InvalidOptions(
                "a filename is required to write a file".to_string(),
            ));
        }
        if self.chunk_size_bytes == Some(0) {
            return Err(GridFsError::InvalidOptions(
                "chunk size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options for finding file records.
#[derive(Debug, Clone, Default)]
pub struct FindFilesOptions {
    pub sort: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

impl FindFilesOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}
