//! Document-mapped records backed by GridFS.
//!
//! [`GridFileModel`] treats a `<bucket>.files` collection as a collection of
//! [`GridFile`] records that read and write their own content.
//! [`GridFsAttachment`] lets records of any [`MappedRecord`] type own one file
//! each, located through a reference field or a filename.

mod attachment;
mod file;
mod naming;
mod record;

pub use attachment::{
    AttachmentOptions, AttachmentWriteOptions, GridFsAttachment, DEFAULT_FILENAME_FIELD,
    DEFAULT_FILE_ID_FIELD, RECORD_ID_FIELD,
};
pub use file::{GridFile, GridFileModel};
pub use naming::{DeriveName, NameSource};
pub use record::{DocumentRecord, MappedRecord};

pub use gridfs_bucket::{GridFsError, Result};
