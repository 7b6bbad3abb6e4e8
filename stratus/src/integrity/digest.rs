//! MD5 helpers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::sync::Arc;

/// Length of an MD5 digest in bytes.
pub const MD5_LENGTH: usize = 16;

/// Raw MD5 digest.
pub type Md5Digest = [u8; MD5_LENGTH];

/// Slot written by the upload digest filter and read by the response hook.
pub type DigestSlot = Arc<Mutex<Option<Md5Digest>>>;

/// Creates an empty digest slot.
#[must_use]
pub fn digest_slot() -> DigestSlot {
    Arc::new(Mutex::new(None))
}

/// Digest of a byte slice.
#[must_use]
pub fn md5(data: &[u8]) -> Md5Digest {
    Md5::digest(data).into()
}

/// Base64 digest, as sent in `Content-MD5`.
#[must_use]
pub fn md5_base64(data: &[u8]) -> String {
    content_md5(&md5(data))
}

/// Encodes a digest for the `Content-MD5` header.
#[must_use]
pub fn content_md5(digest: &Md5Digest) -> String {
    STANDARD.encode(digest)
}

/// Parses an entity tag as a hex MD5 digest.
///
/// Returns `None` for tags that are not a plain digest, such as multipart
/// tags of the form `"<hex>-<parts>"`.
#[must_use]
pub fn etag_digest(etag: &str) -> Option<Md5Digest> {
    let unquoted = etag.trim().trim_matches('"');
    if unquoted.contains('-') {
        return None;
    }
    let bytes = hex::decode(unquoted).ok()?;
    bytes.try_into().ok()
}
