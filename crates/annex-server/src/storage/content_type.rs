//! Content-type detection for staged files
//!
//! Sniffs the file's leading bytes first and falls back to an
//! extension-based lookup when sniffing is inconclusive.

use std::path::Path;

use tokio::io::AsyncReadExt;

/// Number of leading bytes inspected for magic-number detection.
const SNIFF_LEN: usize = 512;

/// Detect the MIME type of a file on disk.
///
/// Returns `None` when neither the leading bytes nor the extension identify
/// a type; the upload then carries no explicit content type and the store
/// applies its default.
pub async fn detect_content_type(path: &Path) -> Option<String> {
    if let Some(mime) = sniff_leading_bytes(path).await {
        return Some(mime);
    }

    mime_guess::from_path(path)
        .first_raw()
        .map(|mime| mime.to_string())
}

async fn sniff_leading_bytes(path: &Path) -> Option<String> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut buf = vec![0u8; SNIFF_LEN];
    let n = file.read(&mut buf).await.ok()?;
    buf.truncate(n);

    infer::get(&buf).map(|kind| kind.mime_type().to_string())
}
