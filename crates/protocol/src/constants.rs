use std::time::Duration;

/// Path of the signing endpoint, relative to the API base URL.
pub const SIGN_PATH: &str = "/sign";

/// Path of the remote deletion endpoint, relative to the API base URL.
pub const DELETE_PATH: &str = "/delete";

/// Default chunk size for sequential uploads (256 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Assets at or below this size are sent in a single request (1 MiB).
pub const DEFAULT_SINGLE_SHOT_THRESHOLD: u64 = 1024 * 1024;

/// Default timeout for any single HTTP request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for obtaining a signed destination.
pub const DEFAULT_SIGN_TIMEOUT: Duration = Duration::from_secs(15);

/// Cumulative byte offset of the chunk carried in the request body.
pub const HEADER_UPLOAD_OFFSET: &str = "x-upload-offset";

/// Hex SHA-256 of the raw (pre-encoding) chunk bytes.
pub const HEADER_CHUNK_SHA256: &str = "x-chunk-sha256";

/// Declares the body encoding of chunk requests.
pub const HEADER_TRANSFER_ENCODING: &str = "content-transfer-encoding";

/// Value of [`HEADER_TRANSFER_ENCODING`] for chunk requests.
pub const CHUNK_BODY_ENCODING: &str = "base64";

/// Query parameter appended to public URLs of static assets to defeat
/// stale CDN and client caches after an overwrite.
pub const CACHE_BUST_PARAM: &str = "v";

/// Builds a `Content-Range` value for bytes `start..start + len` of `total`.
///
/// Returns `None` for an empty range, which has no valid representation.
pub fn content_range(start: u64, len: u64, total: u64) -> Option<String> {
    if len == 0 {
        return None;
    }
    Some(format!("bytes {}-{}/{}", start, start + len - 1, total))
}
