//! Rules deciding when content integrity validation is skipped.

use crate::config::IntegrityConfig;
use crate::http::{names, Headers};
use serde::{Deserialize, Serialize};

/// Request header asking the service to append a trailing checksum.
pub const TRAILING_CHECKSUM_REQUEST: &str = "x-amz-te";

/// Response header confirming a trailing checksum was appended.
pub const TRAILING_CHECKSUM_MARKER: &str = "x-amz-transfer-encoding";

/// Value of both trailing-checksum headers.
pub const APPEND_MD5: &str = "append-md5";

/// Customer-provided encryption key header.
pub const SSE_CUSTOMER_KEY: &str = "x-amz-server-side-encryption-customer-key";

/// KMS key id header.
pub const SSE_KMS_KEY_ID: &str = "x-amz-server-side-encryption-aws-kms-key-id";

const OCTET_STREAM: &str = "application/octet-stream";

/// How an operation participates in integrity validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Object download; validated with a trailing checksum.
    Download,
    /// Object upload; validated against the entity tag, `Content-MD5` computable.
    Upload,
    /// The service requires `Content-MD5` regardless of configuration.
    Md5Required,
    /// No validation.
    #[default]
    Other,
}

/// Returns true if client-side validation is skipped for this request.
#[must_use]
pub fn skip_client_side_request(config: &IntegrityConfig, kind: OperationKind, request: &Headers) -> bool {
    if !config.client_side_validation {
        return true;
    }
    match kind {
        OperationKind::Download => {
            request.contains(names::RANGE) || request.contains(SSE_CUSTOMER_KEY)
        }
        OperationKind::Upload => {
            request.contains(SSE_CUSTOMER_KEY)
                || request.contains(SSE_KMS_KEY_ID)
                || request.contains(names::CONTENT_MD5)
        }
        OperationKind::Md5Required | OperationKind::Other => true,
    }
}

/// Returns true if client-side validation is skipped for this response.
#[must_use]
pub fn skip_client_side_response(config: &IntegrityConfig, kind: OperationKind, response: &Headers) -> bool {
    if !config.client_side_validation {
        return true;
    }
    match kind {
        OperationKind::Download => !response.first_matches(TRAILING_CHECKSUM_MARKER, APPEND_MD5),
        OperationKind::Upload => !response.contains(names::ETAG),
        OperationKind::Md5Required | OperationKind::Other => true,
    }
}

/// Returns true if no `Content-MD5` should be added to the request.
#[must_use]
pub fn skip_server_side(config: &IntegrityConfig, kind: OperationKind, request: &Headers) -> bool {
    match kind {
        OperationKind::Md5Required => request.contains(names::CONTENT_MD5),
        OperationKind::Upload => {
            !config.server_side_validation
                || is_streaming_operation(request)
                || request.contains(names::CONTENT_MD5)
        }
        OperationKind::Download | OperationKind::Other => true,
    }
}

fn is_streaming_operation(request: &Headers) -> bool {
    request.first_matches(names::CONTENT_TYPE, OCTET_STREAM)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(entries: &[(&str, &str)]) -> Headers {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_download_skips() {
        let config = IntegrityConfig::default();
        assert!(!skip_client_side_request(&config, OperationKind::Download, &Headers::new()));
        assert!(skip_client_side_request(
            &config,
            OperationKind::Download,
            &headers(&[("Range", "bytes=0-9")])
        ));
        assert!(skip_client_side_request(
            &config,
            OperationKind::Download,
            &headers(&[(SSE_CUSTOMER_KEY, "key")])
        ));
        assert!(skip_client_side_request(
            &IntegrityConfig::disabled(),
            OperationKind::Download,
            &Headers::new()
        ));
    }

    #[test]
    fn test_download_response_requires_marker() {
        let config = IntegrityConfig::default();
        assert!(skip_client_side_response(&config, OperationKind::Download, &Headers::new()));
        assert!(!skip_client_side_response(
            &config,
            OperationKind::Download,
            &headers(&[("x-amz-transfer-encoding", "append-md5")])
        ));
    }

    #[test]
    fn test_upload_skips() {
        let config = IntegrityConfig::default();
        assert!(!skip_client_side_request(&config, OperationKind::Upload, &Headers::new()));
        for name in [SSE_CUSTOMER_KEY, SSE_KMS_KEY_ID, "content-md5"] {
            assert!(skip_client_side_request(&config, OperationKind::Upload, &headers(&[(name, "x")])));
        }
        assert!(skip_client_side_response(&config, OperationKind::Upload, &Headers::new()));
        assert!(!skip_client_side_response(
            &config,
            OperationKind::Upload,
            &headers(&[("ETag", "\"abc\"")])
        ));
    }

    #[test]
    fn test_server_side() {
        let config = IntegrityConfig::default();
        assert!(!skip_server_side(&config, OperationKind::Upload, &Headers::new()));
        assert!(skip_server_side(
            &config,
            OperationKind::Upload,
            &headers(&[("Content-Type", "application/octet-stream")])
        ));
        assert!(skip_server_side(&IntegrityConfig::disabled(), OperationKind::Upload, &Headers::new()));
        assert!(!skip_server_side(&IntegrityConfig::disabled(), OperationKind::Md5Required, &Headers::new()));
        assert!(skip_server_side(&config, OperationKind::Other, &Headers::new()));
        assert!(skip_server_side(&config, OperationKind::Download, &Headers::new()));
    }
}
