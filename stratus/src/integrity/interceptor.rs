//! Interceptor wiring the integrity filters into request execution.

use super::digest::{content_md5, digest_slot, md5};
use super::strategy::{
    skip_client_side_request, skip_client_side_response, skip_server_side, OperationKind,
    APPEND_MD5, TRAILING_CHECKSUM_REQUEST,
};
use super::trailing::TrailingChecksumFilter;
use super::upload::{verify_upload, DigestingBodyProvider};
use crate::attributes::{
    ExecutionAttributes, INTEGRITY_CONFIG, OPERATION_KIND, TRAILING_CHECKSUM_REQUESTED, UPLOAD_DIGEST,
};
use crate::config::IntegrityConfig;
use crate::errors::StratusError;
use crate::http::{names, Request, RequestBody, Response};
use crate::interceptors::Interceptor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Adds and verifies MD5 digests according to the operation kind.
///
/// Runs last on requests and first on responses so that it sees the final
/// request body and the raw response body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentIntegrityInterceptor {
    config: IntegrityConfig,
}

impl ContentIntegrityInterceptor {
    /// Priority placing this interceptor at the wire end of the chain.
    pub const PRIORITY: i32 = 1_000;

    /// Creates the interceptor with client-wide settings.
    #[must_use]
    pub fn new(config: IntegrityConfig) -> Self {
        Self { config }
    }

    fn settings(&self, attributes: &ExecutionAttributes) -> (IntegrityConfig, OperationKind) {
        (
            attributes.get(&INTEGRITY_CONFIG).copied().unwrap_or(self.config),
            attributes.get(&OPERATION_KIND).copied().unwrap_or_default(),
        )
    }
}

#[async_trait]
impl Interceptor for ContentIntegrityInterceptor {
    fn name(&self) -> &'static str {
        "content-integrity"
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    async fn modify_request(
        &self,
        mut request: Request,
        attributes: &mut ExecutionAttributes,
    ) -> Result<Request, StratusError> {
        let (config, kind) = self.settings(attributes);
        let skip_client = skip_client_side_request(&config, kind, request.headers());
        let skip_server = skip_server_side(&config, kind, request.headers());
        attributes.remove(&TRAILING_CHECKSUM_REQUESTED);
        attributes.remove(&UPLOAD_DIGEST);
        if skip_client && skip_server {
            return Ok(request);
        }

        let buffered_digest = request.body().as_buffered().map(|body| md5(body));
        if !skip_server {
            match buffered_digest {
                Some(digest) => request.headers_mut().insert(names::CONTENT_MD5, content_md5(&digest)),
                None => debug!("Request body is not re-readable, Content-MD5 not computed"),
            }
        }

        if skip_client {
            return Ok(request);
        }
        match kind {
            OperationKind::Download => {
                request.headers_mut().insert(TRAILING_CHECKSUM_REQUEST, APPEND_MD5);
                attributes.put(&TRAILING_CHECKSUM_REQUESTED, true);
            }
            OperationKind::Upload => match request.body().clone() {
                RequestBody::Buffered(_) => {
                    attributes.put(&UPLOAD_DIGEST, Arc::new(Mutex::new(buffered_digest)));
                }
                RequestBody::Streaming(provider) => {
                    let slot = digest_slot();
                    attributes.put(&UPLOAD_DIGEST, slot.clone());
                    request = request.replace_body(RequestBody::Streaming(Arc::new(
                        DigestingBodyProvider::new(provider, slot),
                    )));
                }
                RequestBody::Empty => {}
            },
            OperationKind::Md5Required | OperationKind::Other => {}
        }
        Ok(request)
    }

    async fn modify_response(
        &self,
        response: Response,
        attributes: &mut ExecutionAttributes,
    ) -> Result<Response, StratusError> {
        let (config, kind) = self.settings(attributes);
        if !response.head.is_success() || skip_client_side_response(&config, kind, &response.head.headers) {
            return Ok(response);
        }

        match kind {
            OperationKind::Download if attributes.get(&TRAILING_CHECKSUM_REQUESTED).copied().unwrap_or(false) => {
                let Some(length) = response.head.headers.content_length() else {
                    return Err(StratusError::decode(
                        "trailing checksum response without Content-Length",
                    ));
                };
                let filter = TrailingChecksumFilter::new(length)?;
                let payload_length = filter.payload_length();
                let Response { mut head, body } = response;
                head.headers.insert(names::CONTENT_LENGTH, payload_length.to_string());
                debug!(content_length = length, payload_length, "Validating trailing checksum");
                Ok(Response::new(
                    head,
                    body.with_filter(filter).with_content_length(Some(payload_length)),
                ))
            }
            OperationKind::Upload => {
                if let Some(slot) = attributes.get(&UPLOAD_DIGEST) {
                    verify_upload(slot, &response.head)?;
                }
                Ok(response)
            }
            _ => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Headers, Method, OneShotBody, ResponseHead};
    use crate::stream::ByteStream;
    use bytes::Bytes;

    fn attributes(kind: OperationKind) -> ExecutionAttributes {
        ExecutionAttributes::new().with(&OPERATION_KIND, kind)
    }

    fn response(headers: &[(&str, &str)], body: ByteStream) -> Response {
        Response::new(
            ResponseHead::new(200, "OK", headers.iter().copied().collect::<Headers>()),
            body,
        )
    }

    #[tokio::test]
    async fn test_download_round() {
        let interceptor = ContentIntegrityInterceptor::default();
        let mut attributes = attributes(OperationKind::Download);

        let request = interceptor
            .modify_request(Request::get("http://localhost/bucket/key").unwrap(), &mut attributes)
            .await
            .unwrap();
        assert_eq!(request.headers().first("x-amz-te"), Some("append-md5"));

        let payload = b"object contents";
        let mut body = payload.to_vec();
        body.extend_from_slice(&md5(payload));
        let length = body.len().to_string();
        let response = response(
            &[("Content-Length", length.as_str()), ("x-amz-transfer-encoding", "append-md5")],
            ByteStream::from_bytes(body),
        );

        let response = interceptor.modify_response(response, &mut attributes).await.unwrap();
        assert_eq!(response.head.headers.content_length(), Some(payload.len() as u64));
        assert_eq!(response.body.content_length(), Some(payload.len() as u64));
        assert_eq!(response.body.collect().await.unwrap(), &payload[..]);
    }

    #[tokio::test]
    async fn test_download_without_marker_is_untouched() {
        let interceptor = ContentIntegrityInterceptor::default();
        let mut attributes = attributes(OperationKind::Download);
        interceptor
            .modify_request(Request::get("http://localhost/k").unwrap(), &mut attributes)
            .await
            .unwrap();

        let response = response(&[("Content-Length", "3")], ByteStream::from_bytes("abc"));
        let response = interceptor.modify_response(response, &mut attributes).await.unwrap();
        assert_eq!(response.body.collect().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_range_download_not_requested() {
        let interceptor = ContentIntegrityInterceptor::default();
        let mut attributes = attributes(OperationKind::Download);
        let request = Request::get("http://localhost/k")
            .unwrap()
            .with_header("Range", "bytes=0-1");
        let request = interceptor.modify_request(request, &mut attributes).await.unwrap();
        assert!(!request.headers().contains("x-amz-te"));
        assert!(!attributes.contains(&TRAILING_CHECKSUM_REQUESTED));
    }

    #[tokio::test]
    async fn test_buffered_upload_adds_content_md5_and_checks_etag() {
        let interceptor = ContentIntegrityInterceptor::default();
        let mut attributes = attributes(OperationKind::Upload);
        let request = interceptor
            .modify_request(Request::put("http://localhost/k", "hello").unwrap(), &mut attributes)
            .await
            .unwrap();
        assert_eq!(request.headers().first("content-md5"), Some("XUFAKrxLKna5cZ2REBfFkg=="));

        let ok = response(&[("ETag", "\"5d41402abc4b2a76b9719d911017c592\"")], ByteStream::empty());
        interceptor.modify_response(ok, &mut attributes).await.unwrap();

        let bad = response(&[("ETag", "\"ffffffffffffffffffffffffffffffff\"")], ByteStream::empty());
        let err = interceptor.modify_response(bad, &mut attributes).await.unwrap_err();
        assert!(matches!(err, StratusError::IntegrityMismatch(_)));
    }

    #[tokio::test]
    async fn test_streaming_upload_digested_inline() {
        let interceptor = ContentIntegrityInterceptor::default();
        let mut attributes = attributes(OperationKind::Upload);
        let body = ByteStream::from_chunks([Bytes::from_static(b"hel"), Bytes::from_static(b"lo")]);
        let request = Request::new(Method::Put, "http://localhost/k")
            .unwrap()
            .with_header("Content-Type", "application/octet-stream")
            .with_streaming_body(Arc::new(OneShotBody::new(body)));

        let request = interceptor.modify_request(request, &mut attributes).await.unwrap();
        assert!(!request.headers().contains("content-md5"));
        assert_eq!(request.body().open().unwrap().collect().await.unwrap(), "hello");

        let slot = attributes.get(&UPLOAD_DIGEST).unwrap();
        assert_eq!(*slot.lock(), Some(md5(b"hello")));
    }

    #[tokio::test]
    async fn test_disabled_by_attribute_override() {
        let interceptor = ContentIntegrityInterceptor::default();
        let mut attributes = attributes(OperationKind::Upload).with(&INTEGRITY_CONFIG, IntegrityConfig::disabled());
        let request = interceptor
            .modify_request(Request::put("http://localhost/k", "hello").unwrap(), &mut attributes)
            .await
            .unwrap();
        assert!(!request.headers().contains("content-md5"));
        assert!(!attributes.contains(&UPLOAD_DIGEST));
    }
}
