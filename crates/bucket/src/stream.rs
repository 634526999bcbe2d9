//! Read and write stream handles returned by [`crate::Bucket`].

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bson::{doc, Bson, Document};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::TryStreamExt;
use tracing::{debug, info};

use crate::backend::{ByteReader, ByteWriter, GridFsBackend};
use crate::error::{GridFsError, Result};
use crate::options::FindFilesOptions;
use crate::record::{id_to_string, FileRecord};

/// Download stream over one stored file, optionally restricted to a byte range.
pub struct ReadStream {
    inner: ByteReader,
}

impl ReadStream {
    /// Wrap a backend stream, skipping `start` bytes and stopping at `end`.
    pub(crate) async fn new(
        mut inner: ByteReader,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Self> {
        let start = start.unwrap_or(0);
        if start > 0 {
            let skipped =
                futures::io::copy((&mut inner).take(start), &mut futures::io::sink()).await?;
            debug!("Skipped {} bytes to reach range start {}", skipped, start);
        }
        let inner: ByteReader = match end {
            Some(end) => Box::pin(inner.take(end.saturating_sub(start))),
            None => inner,
        };
        Ok(Self { inner })
    }

    /// Drain the remaining content into a buffer.
    pub async fn read_to_vec(mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.inner.read_to_end(&mut buffer).await?;
        Ok(buffer)
    }
}

impl AsyncRead for ReadStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().inner.as_mut().poll_read(cx, buf)
    }
}

/// Upload stream for one new file.
///
/// Bytes written are handed to the backend; [`WriteStream::finish`] closes the
/// upload and returns the stored record.
pub struct WriteStream {
    inner: ByteWriter,
    backend: Arc<dyn GridFsBackend>,
    id: Bson,
    filename: String,
    extra_fields: Document,
}

impl WriteStream {
    pub(crate) fn new(
        inner: ByteWriter,
        backend: Arc<dyn GridFsBackend>,
        id: Bson,
        filename: String,
        extra_fields: Document,
    ) -> Self {
        Self {
            inner,
            backend,
            id,
            filename,
            extra_fields,
        }
    }

    /// Identifier the file will be stored under.
    pub fn id(&self) -> &Bson {
        &self.id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Close the upload and fetch the stored file record.
    ///
    /// Resolves only after every written byte has been flushed to the backend.
    pub async fn finish(mut self) -> Result<FileRecord> {
        self.inner.flush().await?;
        self.inner.close().await?;

        if !self.extra_fields.is_empty() {
            self.backend
                .update_file(&self.id, std::mem::take(&mut self.extra_fields))
                .await?;
        }

        let mut records = self
            .backend
            .find(doc! { "_id": self.id.clone() }, FindFilesOptions::new().with_limit(1))
            .await?;
        let record = records
            .try_next()
            .await?
            .ok_or_else(|| {
                GridFsError::FileNotFound(format!(
                    "id {} after upload to bucket '{}'",
                    id_to_string(&self.id),
                    self.backend.bucket_name()
                ))
            })?;

        info!(
            "Stored '{}' ({}, {} bytes) in bucket '{}'",
            record.filename,
            id_to_string(&record.id),
            record.length,
            self.backend.bucket_name()
        );
        Ok(record)
    }
}

impl AsyncWrite for WriteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.as_mut().poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.as_mut().poll_close(cx)
    }
}
