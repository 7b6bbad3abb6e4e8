//! Upload digests compared against the service's entity tag.

use super::digest::{etag_digest, DigestSlot};
use crate::errors::{IntegrityMismatchError, StratusError, TransferDirection};
use crate::http::{names, BodyProvider, ResponseHead};
use crate::stream::{ByteStream, ChunkFilter};
use bytes::Bytes;
use md5::{Digest, Md5};
use std::sync::Arc;
use tracing::{debug, warn};

/// Digests a request body as the transport reads it.
///
/// The digest is written to the slot when the body completes.
#[derive(Debug)]
pub struct UploadDigestFilter {
    hasher: Md5,
    slot: DigestSlot,
}

impl UploadDigestFilter {
    /// Creates a filter writing into `slot`.
    #[must_use]
    pub fn new(slot: DigestSlot) -> Self {
        Self {
            hasher: Md5::new(),
            slot,
        }
    }
}

impl ChunkFilter for UploadDigestFilter {
    fn name(&self) -> &'static str {
        "upload-digest"
    }

    fn on_chunk(&mut self, chunk: Bytes) -> Result<Option<Bytes>, StratusError> {
        self.hasher.update(&chunk);
        Ok(Some(chunk))
    }

    fn on_complete(&mut self) -> Result<(), StratusError> {
        *self.slot.lock() = Some(self.hasher.finalize_reset().into());
        Ok(())
    }
}

/// Body provider whose every opened stream is digested into a slot.
pub struct DigestingBodyProvider {
    inner: Arc<dyn BodyProvider>,
    slot: DigestSlot,
}

impl DigestingBodyProvider {
    /// Wraps a provider.
    #[must_use]
    pub fn new(inner: Arc<dyn BodyProvider>, slot: DigestSlot) -> Self {
        Self { inner, slot }
    }
}

impl BodyProvider for DigestingBodyProvider {
    fn open(&self) -> ByteStream {
        self.slot.lock().take();
        self.inner
            .open()
            .with_filter(UploadDigestFilter::new(self.slot.clone()))
    }

    fn content_length(&self) -> Option<u64> {
        self.inner.content_length()
    }

    fn is_replayable(&self) -> bool {
        self.inner.is_replayable()
    }
}

/// Compares the uploaded digest with the response's entity tag.
///
/// Missing tags, multipart tags and bodies that never completed are skipped.
///
/// # Errors
///
/// Returns `IntegrityMismatch` when both digests are known and differ.
pub fn verify_upload(slot: &DigestSlot, head: &ResponseHead) -> Result<(), StratusError> {
    let Some(etag) = head.headers.first(names::ETAG) else {
        debug!("No entity tag in response, skipping upload validation");
        return Ok(());
    };
    let Some(expected) = etag_digest(etag) else {
        debug!(etag, "Entity tag is not a plain digest, skipping upload validation");
        return Ok(());
    };
    let Some(computed) = *slot.lock() else {
        debug!("Upload digest unavailable, skipping upload validation");
        return Ok(());
    };
    if expected == computed {
        Ok(())
    } else {
        let error = IntegrityMismatchError::new(TransferDirection::Upload, &expected, &computed);
        warn!(expected = %error.expected, computed = %error.computed, "Upload integrity mismatch");
        Err(error.into())
    }
}
