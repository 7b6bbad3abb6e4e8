//! End-to-end content integrity verification.
//!
//! Downloads are checked against a checksum the service appends to the body;
//! uploads are digested on the way out and compared with the entity tag.

mod digest;
mod interceptor;
pub mod strategy;
mod trailing;
mod upload;

pub use digest::{content_md5, digest_slot, etag_digest, md5, md5_base64, DigestSlot, Md5Digest, MD5_LENGTH};
pub use interceptor::ContentIntegrityInterceptor;
pub use strategy::OperationKind;
pub use trailing::{TrailingChecksumFilter, TrailingChecksumReader, TrailingChecksumSplitter};
pub use upload::{verify_upload, DigestingBodyProvider, UploadDigestFilter};
