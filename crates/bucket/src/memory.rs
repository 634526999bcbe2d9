//! In-process datastore with the GridFS collection layout.
//!
//! Files live as documents in `<bucket>.files` and their content as numbered
//! chunk documents in `<bucket>.chunks`, with the same unique keys MongoDB
//! enforces (`_id` everywhere, `(files_id, n)` on chunks). Useful for tests
//! and for embedding without a server.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, spec::BinarySubtype, Binary, Bson, DateTime, Document};
use futures::io::{AsyncWrite, Cursor};
use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::backend::{
    ByteReader, ByteWriter, Datastore, FileRecordStream, GridFsBackend, UploadOptions,
};
use crate::error::{GridFsError, Result};
use crate::options::{
    chunks_collection_name, files_collection_name, BucketConfig, FindFilesOptions,
    CHUNKS_COLLECTION_SUFFIX, DEFAULT_CHUNK_SIZE_BYTES,
};
use crate::path::get_path;
use crate::record::{id_to_string, FileRecord};

type Collections = HashMap<String, Vec<Document>>;

/// In-memory datastore. Clones share the same collections.
#[derive(Clone)]
pub struct MemoryDatastore {
    collections: Arc<Mutex<Collections>>,
    connected: Arc<AtomicBool>,
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Share this datastore behind the [`Datastore`] trait.
    pub fn shared(&self) -> Arc<dyn Datastore> {
        Arc::new(self.clone())
    }

    /// Drop the connection; every later operation fails with `NotConnected`.
    pub fn disconnect(&self) {
        self.connected.store(false, AtomicOrdering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, AtomicOrdering::SeqCst);
    }

    /// Number of documents in `collection` matching `filter`.
    pub fn count_documents(&self, collection: &str, filter: &Document) -> usize {
        let collections = self.lock();
        collections
            .get(collection)
            .map(|docs| docs.iter().filter(|d| matches_filter(d, filter)).count())
            .unwrap_or(0)
    }

    /// Snapshot of every document in `collection`.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock().get(collection).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        self.collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(GridFsError::NotConnected)
        }
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    fn is_connected(&self) -> bool {
        self.connected.load(AtomicOrdering::SeqCst)
    }

    fn open_bucket(&self, config: &BucketConfig) -> Result<Arc<dyn GridFsBackend>> {
        self.ensure_connected()?;
        Ok(Arc::new(MemoryBucket {
            name: config.name.clone(),
            chunk_size_bytes: config.chunk_size_bytes.unwrap_or(DEFAULT_CHUNK_SIZE_BYTES),
            store: self.clone(),
        }))
    }

    async fn save_document(&self, collection: &str, document: Document) -> Result<()> {
        self.ensure_connected()?;
        let id = document.get("_id").cloned().ok_or(GridFsError::MissingId)?;
        let mut collections = self.lock();
        let docs = collections.entry(collection.to_string()).or_default();
        match docs
            .iter_mut()
            .find(|existing| existing.get("_id").is_some_and(|v| bson_eq(v, &id)))
        {
            Some(existing) => *existing = document,
            None => docs.push(document),
        }
        Ok(())
    }

    async fn find_document(&self, collection: &str, filter: Document) -> Result<Option<Document>> {
        self.ensure_connected()?;
        let collections = self.lock();
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| matches_filter(d, &filter)).cloned()))
    }
}

/// One bucket inside a [`MemoryDatastore`].
pub struct MemoryBucket {
    name: String,
    chunk_size_bytes: u32,
    store: MemoryDatastore,
}

impl MemoryBucket {
    fn files_collection(&self) -> String {
        files_collection_name(&self.name)
    }

    fn chunks_collection(&self) -> String {
        chunks_collection_name(&self.name)
    }

    /// Reassemble a file's content from its chunks.
    fn assemble(&self, collections: &Collections, record: &FileRecord) -> Result<Vec<u8>> {
        let mut chunks: Vec<(i64, &[u8])> = collections
            .get(&self.chunks_collection())
            .map(|docs| {
                docs.iter()
                    .filter(|c| c.get("files_id").is_some_and(|v| bson_eq(v, &record.id)))
                    .filter_map(|c| {
                        let n = c.get("n").and_then(as_f64)? as i64;
                        match c.get("data")? {
                            Bson::Binary(binary) => Some((n, binary.bytes.as_slice())),
                            _ => None,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        chunks.sort_by_key(|(n, _)| *n);

        let mut data = Vec::with_capacity(record.length.max(0) as usize);
        for (expected, (n, bytes)) in chunks.iter().enumerate() {
            if *n != expected as i64 {
                return Err(GridFsError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "missing chunk {expected} of file {}",
                        id_to_string(&record.id)
                    ),
                )));
            }
            data.extend_from_slice(bytes);
        }
        if data.len() as i64 != record.length {
            return Err(GridFsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "file {} has {} bytes of chunk data, expected {}",
                    id_to_string(&record.id),
                    data.len(),
                    record.length
                ),
            )));
        }
        Ok(data)
    }

    fn records_named(&self, collections: &Collections, filename: &str) -> Result<Vec<FileRecord>> {
        let filter = doc! { "filename": filename };
        let sort = doc! { "uploadDate": 1 };
        find_in(collections, &self.files_collection(), &filter, Some(&sort))
            .into_iter()
            .map(FileRecord::from_document)
            .collect()
    }
}

#[async_trait]
impl GridFsBackend for MemoryBucket {
    fn bucket_name(&self) -> &str {
        &self.name
    }

    async fn open_upload_stream(
        &self,
        filename: &str,
        options: UploadOptions,
    ) -> Result<ByteWriter> {
        self.store.ensure_connected()?;
        let chunk_size_bytes = options.chunk_size_bytes.unwrap_or(self.chunk_size_bytes);
        Ok(Box::pin(MemoryUpload {
            store: self.store.clone(),
            bucket: self.name.clone(),
            filename: filename.to_string(),
            chunk_size_bytes,
            options,
            buffer: Vec::new(),
            closed: false,
        }))
    }

    async fn open_download_stream(&self, id: Bson) -> Result<ByteReader> {
        self.store.ensure_connected()?;
        let collections = self.store.lock();
        let document = find_in(
            &collections,
            &self.files_collection(),
            &doc! { "_id": id.clone() },
            None,
        )
        .into_iter()
        .next()
        .ok_or_else(|| GridFsError::FileNotFound(format!("id {}", id_to_string(&id))))?;
        let record = FileRecord::from_document(document)?;
        let data = self.assemble(&collections, &record)?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn open_download_stream_by_name(
        &self,
        filename: &str,
        revision: i32,
    ) -> Result<ByteReader> {
        self.store.ensure_connected()?;
        let collections = self.store.lock();
        let revisions = self.records_named(&collections, filename)?;
        if revisions.is_empty() {
            return Err(GridFsError::FileNotFound(format!("filename '{filename}'")));
        }

        let index = if revision >= 0 {
            revision as i64
        } else {
            revisions.len() as i64 + revision as i64
        };
        let record = usize::try_from(index)
            .ok()
            .and_then(|i| revisions.get(i))
            .ok_or_else(|| {
                GridFsError::FileNotFound(format!("revision {revision} of '{filename}'"))
            })?;
        let data = self.assemble(&collections, record)?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn delete(&self, id: Bson) -> Result<()> {
        self.store.ensure_connected()?;
        let mut collections = self.store.lock();
        delete_in(
            &mut collections,
            &self.chunks_collection(),
            &doc! { "files_id": id.clone() },
        );
        let removed = delete_in(
            &mut collections,
            &self.files_collection(),
            &doc! { "_id": id.clone() },
        );
        if removed == 0 {
            return Err(GridFsError::FileNotFound(format!("id {}", id_to_string(&id))));
        }
        Ok(())
    }

    async fn find(&self, filter: Document, options: FindFilesOptions) -> Result<FileRecordStream> {
        self.store.ensure_connected()?;
        let documents = {
            let collections = self.store.lock();
            find_in(
                &collections,
                &self.files_collection(),
                &filter,
                options.sort.as_ref(),
            )
        };

        let skip = options.skip.unwrap_or(0) as usize;
        // Negative limits behave like MongoDB's single-batch form: take |limit|.
        let limit = match options.limit {
            Some(0) | None => usize::MAX,
            Some(n) => n.unsigned_abs() as usize,
        };
        let records: Vec<Result<FileRecord>> = documents
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(FileRecord::from_document)
            .collect();
        Ok(stream::iter(records).boxed())
    }

    async fn update_file(&self, id: &Bson, fields: Document) -> Result<()> {
        self.store.ensure_connected()?;
        let mut collections = self.store.lock();
        if let Some(docs) = collections.get_mut(&self.files_collection()) {
            for document in docs.iter_mut().filter(|d| d.get("_id").is_some_and(|v| bson_eq(v, id))) {
                for (key, value) in fields.iter() {
                    document.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }
}

/// Buffers written bytes and commits chunks plus the file record on close.
struct MemoryUpload {
    store: MemoryDatastore,
    bucket: String,
    filename: String,
    chunk_size_bytes: u32,
    options: UploadOptions,
    buffer: Vec<u8>,
    closed: bool,
}

impl MemoryUpload {
    fn commit(&mut self) -> Result<()> {
        self.store.ensure_connected()?;
        let id = self.options.id.clone();
        let chunk_size = self.chunk_size_bytes.max(1) as usize;

        let chunks: Vec<Document> = self
            .buffer
            .chunks(chunk_size)
            .enumerate()
            .map(|(n, bytes)| {
                doc! {
                    "_id": ObjectId::new(),
                    "files_id": id.clone(),
                    "n": n as i32,
                    "data": Binary { subtype: BinarySubtype::Generic, bytes: bytes.to_vec() },
                }
            })
            .collect();

        let record = FileRecord {
            id: id.clone(),
            filename: self.filename.clone(),
            length: self.buffer.len() as i64,
            chunk_size: self.chunk_size_bytes as i32,
            upload_date: DateTime::now(),
            metadata: self.options.metadata.clone(),
            aliases: None,
            content_type: None,
            md5: None,
        };

        let mut collections = self.store.lock();
        let chunks_collection = chunks_collection_name(&self.bucket);
        let files_collection = files_collection_name(&self.bucket);
        check_unique(&collections, &chunks_collection, &chunks)?;
        check_unique(&collections, &files_collection, std::slice::from_ref(&record.to_document()?))?;

        collections
            .entry(chunks_collection)
            .or_default()
            .extend(chunks);
        collections
            .entry(files_collection)
            .or_default()
            .push(record.to_document()?);

        debug!(
            "Committed {} bytes as '{}' ({}) in bucket '{}'",
            record.length,
            record.filename,
            id_to_string(&record.id),
            self.bucket
        );
        Ok(())
    }
}

impl AsyncWrite for MemoryUpload {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "upload stream is already closed",
            )));
        }
        this.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        this.closed = true;
        Poll::Ready(
            this.commit()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        )
    }
}

/// Reject `incoming` if any document collides with a unique key already present
/// (or with another incoming document).
fn check_unique(collections: &Collections, collection: &str, incoming: &[Document]) -> Result<()> {
    let existing = collections.get(collection).map(Vec::as_slice).unwrap_or(&[]);
    let is_chunks = collection.ends_with(CHUNKS_COLLECTION_SUFFIX);

    for (i, document) in incoming.iter().enumerate() {
        let others = existing.iter().chain(incoming[..i].iter());
        for other in others {
            if let (Some(a), Some(b)) = (document.get("_id"), other.get("_id")) {
                if bson_eq(a, b) {
                    return Err(GridFsError::DuplicateKey {
                        collection: collection.to_string(),
                        key: format!("{{ _id: {} }}", id_to_string(a)),
                    });
                }
            }
            if is_chunks {
                let same_file = match (document.get("files_id"), other.get("files_id")) {
                    (Some(a), Some(b)) => bson_eq(a, b),
                    _ => false,
                };
                let same_n = match (document.get("n"), other.get("n")) {
                    (Some(a), Some(b)) => bson_eq(a, b),
                    _ => false,
                };
                if same_file && same_n {
                    let files_id = document.get("files_id").map(id_to_string).unwrap_or_default();
                    let n = document.get("n").map(|n| n.to_string()).unwrap_or_default();
                    return Err(GridFsError::DuplicateKey {
                        collection: collection.to_string(),
                        key: format!("{{ files_id: {files_id}, n: {n} }}"),
                    });
                }
            }
        }
    }
    Ok(())
}

fn find_in(
    collections: &Collections,
    collection: &str,
    filter: &Document,
    sort: Option<&Document>,
) -> Vec<Document> {
    let mut matched: Vec<Document> = collections
        .get(collection)
        .map(|docs| {
            docs.iter()
                .filter(|d| matches_filter(d, filter))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    if let Some(sort) = sort {
        // Stable, so documents with equal keys keep insertion order.
        matched.sort_by(|a, b| compare_by_sort(a, b, sort));
    }
    matched
}

fn delete_in(collections: &mut Collections, collection: &str, filter: &Document) -> usize {
    match collections.get_mut(collection) {
        Some(docs) => {
            let before = docs.len();
            docs.retain(|d| !matches_filter(d, filter));
            before - docs.len()
        }
        None => 0,
    }
}

/// Equality filters on dotted paths, plus the `$in`, `$ne` and `$exists` operators.
fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(path, expected)| {
        let actual = get_path(document, path);
        match expected {
            Bson::Document(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => {
                ops.iter().all(|(op, arg)| match (op.as_str(), arg) {
                    ("$in", Bson::Array(values)) => {
                        actual.is_some_and(|a| values.iter().any(|v| bson_eq(a, v)))
                    }
                    ("$ne", value) => !actual.is_some_and(|a| bson_eq(a, value)),
                    ("$exists", Bson::Boolean(wanted)) => actual.is_some() == *wanted,
                    _ => false,
                })
            }
            _ => actual.is_some_and(|a| bson_eq(a, expected)),
        }
    })
}

fn compare_by_sort(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (path, direction) in sort.iter() {
        let descending = as_f64(direction).is_some_and(|d| d < 0.0);
        let ordering = compare_bson(get_path(a, path), get_path(b, path));
        let ordering = if descending { ordering.reverse() } else { ordering };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Equality with numeric types compared by value.
fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn type_rank(value: Option<&Bson>) -> u8 {
    match value {
        None | Some(Bson::Null) => 0,
        Some(Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => 1,
        Some(Bson::String(_)) => 2,
        Some(Bson::Document(_)) => 3,
        Some(Bson::Array(_)) => 4,
        Some(Bson::Binary(_)) => 5,
        Some(Bson::ObjectId(_)) => 6,
        Some(Bson::Boolean(_)) => 7,
        Some(Bson::DateTime(_)) => 8,
        Some(_) => 9,
    }
}

fn compare_bson(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Some(x), Some(y)) => match (x, y) {
            (Bson::String(x), Bson::String(y)) => x.cmp(y),
            (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
            (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
            (Bson::DateTime(x), Bson::DateTime(y)) => {
                x.timestamp_millis().cmp(&y.timestamp_millis())
            }
            _ => match (as_f64(x), as_f64(y)) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            },
        },
        _ => Ordering::Equal,
    }
}
