//! Trailing-checksum download validation.
//!
//! A body of declared length `C` carries `C - 16` payload bytes followed by
//! the 16-byte MD5 of the payload. The digest is consumed, never exposed.

use super::digest::MD5_LENGTH;
use crate::errors::{IntegrityMismatchError, StratusError, TransferDirection};
use crate::stream::ChunkFilter;
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use std::io::{self, Read};
use tracing::warn;

const DIGEST_LENGTH: u64 = MD5_LENGTH as u64;

/// Incremental payload/digest splitter shared by the async filter and the
/// blocking reader.
///
/// Payload bytes of the chunk that reaches the boundary are held until the
/// digest has been verified.
#[derive(Debug)]
pub struct TrailingChecksumSplitter {
    content_length: u64,
    payload_length: u64,
    position: u64,
    hasher: Md5,
    held: BytesMut,
    expected: Vec<u8>,
    verified: bool,
}

impl TrailingChecksumSplitter {
    /// Creates a splitter for a body of `content_length` bytes.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the body is too short to hold a digest.
    pub fn new(content_length: u64) -> Result<Self, StratusError> {
        let payload_length = content_length.checked_sub(DIGEST_LENGTH).ok_or_else(|| {
            StratusError::decode(format!(
                "content length {content_length} is shorter than the trailing checksum"
            ))
        })?;
        Ok(Self {
            content_length,
            payload_length,
            position: 0,
            hasher: Md5::new(),
            held: BytesMut::new(),
            expected: Vec::with_capacity(MD5_LENGTH),
            verified: false,
        })
    }

    /// Number of payload bytes.
    #[must_use]
    pub fn payload_length(&self) -> u64 {
        self.payload_length
    }

    /// Returns true once the digest has been read and matched.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Feeds one chunk; returns the payload bytes that may be released.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityMismatch` when the digest does not match, and a
    /// decode error for bytes past the declared length.
    pub fn push(&mut self, mut chunk: Bytes) -> Result<Option<Bytes>, StratusError> {
        if chunk.is_empty() {
            return Ok(None);
        }
        if self.verified {
            return Err(self.overlong());
        }

        let remaining_payload = self.payload_length.saturating_sub(self.position);
        let payload_take = usize::try_from(remaining_payload).map_or(chunk.len(), |r| r.min(chunk.len()));
        let payload = chunk.split_to(payload_take);
        self.position += payload.len() as u64;
        self.hasher.update(&payload);

        if self.position < self.payload_length {
            return Ok(Some(payload));
        }

        self.held.extend_from_slice(&payload);
        if chunk.len() > MD5_LENGTH - self.expected.len() {
            return Err(self.overlong());
        }
        self.position += chunk.len() as u64;
        self.expected.extend_from_slice(&chunk);

        if self.expected.len() < MD5_LENGTH {
            return Ok(None);
        }

        let computed = self.hasher.finalize_reset();
        if computed.as_slice() != self.expected.as_slice() {
            self.held.clear();
            let error = IntegrityMismatchError::new(TransferDirection::Download, &self.expected, &computed);
            warn!(expected = %error.expected, computed = %error.computed, "Download integrity mismatch");
            return Err(error.into());
        }
        self.verified = true;
        let released = self.held.split().freeze();
        Ok((!released.is_empty()).then_some(released))
    }

    /// Checks that the whole body, digest included, was received.
    ///
    /// # Errors
    ///
    /// Returns a decode error for a truncated body.
    pub fn finish(&self) -> Result<(), StratusError> {
        if self.verified {
            Ok(())
        } else {
            Err(StratusError::decode(format!(
                "body truncated: expected {} bytes, received {}",
                self.content_length, self.position
            )))
        }
    }

    fn overlong(&self) -> StratusError {
        StratusError::decode(format!(
            "body exceeds declared content length {}",
            self.content_length
        ))
    }
}

/// [`ChunkFilter`] stripping and verifying a trailing checksum.
#[derive(Debug)]
pub struct TrailingChecksumFilter {
    splitter: TrailingChecksumSplitter,
}

impl TrailingChecksumFilter {
    /// Creates a filter for a body of `content_length` bytes.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the body is too short to hold a digest.
    pub fn new(content_length: u64) -> Result<Self, StratusError> {
        Ok(Self {
            splitter: TrailingChecksumSplitter::new(content_length)?,
        })
    }

    /// Number of payload bytes the consumer will see.
    #[must_use]
    pub fn payload_length(&self) -> u64 {
        self.splitter.payload_length()
    }
}

impl ChunkFilter for TrailingChecksumFilter {
    fn name(&self) -> &'static str {
        "trailing-checksum"
    }

    fn on_chunk(&mut self, chunk: Bytes) -> Result<Option<Bytes>, StratusError> {
        self.splitter.push(chunk)
    }

    fn on_complete(&mut self) -> Result<(), StratusError> {
        self.splitter.finish()
    }
}

/// Blocking reader stripping and verifying a trailing checksum.
///
/// A read asking for more than the remaining payload returns only the
/// payload portion; the digest is consumed and compared before that read
/// returns.
#[derive(Debug)]
pub struct TrailingChecksumReader<R> {
    inner: R,
    remaining_payload: u64,
    hasher: Md5,
    verified: bool,
}

impl<R: Read> TrailingChecksumReader<R> {
    /// Wraps a reader over a body of `content_length` bytes.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the body is too short to hold a digest.
    pub fn new(inner: R, content_length: u64) -> Result<Self, StratusError> {
        let splitter = TrailingChecksumSplitter::new(content_length)?;
        Ok(Self {
            inner,
            remaining_payload: splitter.payload_length(),
            hasher: Md5::new(),
            verified: false,
        })
    }

    /// Returns the wrapped reader.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn verify(&mut self) -> io::Result<()> {
        let mut expected = [0u8; MD5_LENGTH];
        self.inner.read_exact(&mut expected).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                invalid_data(StratusError::decode("body truncated inside trailing checksum"))
            } else {
                e
            }
        })?;
        let computed = self.hasher.finalize_reset();
        if computed.as_slice() != expected {
            return Err(invalid_data(
                IntegrityMismatchError::new(TransferDirection::Download, &expected, &computed).into(),
            ));
        }
        let mut probe = [0u8; 1];
        if self.inner.read(&mut probe)? != 0 {
            return Err(invalid_data(StratusError::decode(
                "body exceeds declared content length",
            )));
        }
        self.verified = true;
        Ok(())
    }
}

impl<R: Read> Read for TrailingChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining_payload == 0 {
            if !self.verified {
                self.verify()?;
            }
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let want = usize::try_from(self.remaining_payload).map_or(buf.len(), |r| r.min(buf.len()));
        let read = self.inner.read(&mut buf[..want])?;
        if read == 0 {
            return Err(invalid_data(StratusError::decode(format!(
                "body truncated: {} payload bytes missing",
                self.remaining_payload
            ))));
        }
        self.hasher.update(&buf[..read]);
        self.remaining_payload -= read as u64;

        if self.remaining_payload == 0 {
            self.verify()?;
        }
        Ok(read)
    }
}

fn invalid_data(error: StratusError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::digest::md5;
    use crate::stream::ByteStream;

    fn body_with_checksum(payload: &[u8]) -> Vec<u8> {
        let mut body = payload.to_vec();
        body.extend_from_slice(&md5(payload));
        body
    }

    fn chunked(body: &[u8], size: usize) -> Vec<Bytes> {
        body.chunks(size).map(Bytes::copy_from_slice).collect()
    }

    #[tokio::test]
    async fn test_filter_strips_matching_checksum() {
        let payload = b"the quick brown fox jumps over the lazy dog";
        let body = body_with_checksum(payload);
        let length = body.len() as u64;

        for size in [1, 5, 16, 17, body.len()] {
            let stream = ByteStream::from_chunks(chunked(&body, size))
                .with_filter(TrailingChecksumFilter::new(length).unwrap());
            assert_eq!(stream.collect().await.unwrap(), &payload[..], "chunk size {size}");
        }
    }

    #[tokio::test]
    async fn test_filter_mismatch_withholds_boundary_chunk() {
        let payload = b"0123456789abcdef0123";
        let mut body = body_with_checksum(payload);
        let last = body.len() - 1;
        body[last] ^= 0xff;
        let length = body.len() as u64;

        let mut stream = ByteStream::from_chunks(chunked(&body, 8))
            .with_filter(TrailingChecksumFilter::new(length).unwrap());
        let mut subscription = stream.subscribe().unwrap();

        let mut delivered = Vec::new();
        let mut failure = None;
        while let Some(item) = subscription.pull().await {
            match item {
                Ok(chunk) => delivered.extend_from_slice(&chunk),
                Err(error) => failure = Some(error),
            }
        }

        assert_eq!(delivered, &payload[..16]);
        match failure {
            Some(StratusError::IntegrityMismatch(e)) => {
                assert_eq!(e.computed, hex::encode(md5(payload)));
                assert_eq!(e.direction, TransferDirection::Download);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_filter_truncated_and_overlong() {
        let body = body_with_checksum(b"payload");
        let length = body.len() as u64;

        let truncated = ByteStream::from_bytes(Bytes::copy_from_slice(&body[..body.len() - 3]))
            .with_filter(TrailingChecksumFilter::new(length).unwrap());
        assert!(matches!(truncated.collect().await, Err(StratusError::ResponseDecode(_))));

        let mut long = body.clone();
        long.push(0);
        let overlong = ByteStream::from_bytes(long).with_filter(TrailingChecksumFilter::new(length).unwrap());
        assert!(matches!(overlong.collect().await, Err(StratusError::ResponseDecode(_))));
    }

    #[test]
    fn test_content_length_shorter_than_digest() {
        assert!(TrailingChecksumSplitter::new(15).is_err());
        let mut splitter = TrailingChecksumSplitter::new(16).unwrap();
        assert_eq!(splitter.push(Bytes::copy_from_slice(&md5(b""))).unwrap(), None);
        assert!(splitter.is_verified());
        splitter.finish().unwrap();
    }

    #[test]
    fn test_reader_returns_only_payload() {
        let payload = b"abcdefghijklmnopqrstuvwxyz";
        let body = body_with_checksum(payload);
        let mut reader = TrailingChecksumReader::new(&body[..], body.len() as u64).unwrap();

        let mut buf = [0u8; 100];
        let read = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..read], &payload[..]);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_reader_mismatch() {
        let mut body = body_with_checksum(b"abcdef");
        body[2] = b'X';
        let mut reader = TrailingChecksumReader::new(&body[..], body.len() as u64).unwrap();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("Client calculated content hash"));
    }

    #[test]
    fn test_reader_small_reads() {
        let payload = b"0123456789";
        let body = body_with_checksum(payload);
        let mut reader = TrailingChecksumReader::new(&body[..], body.len() as u64).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let read = reader.read(&mut buf).unwrap();
            if read == 0 {
                break;
            }
            out.extend_from_slice(&buf[..read]);
        }
        assert_eq!(out, payload);
    }
}
