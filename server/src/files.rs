use anyhow::Result;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const MAX_EXT_LEN: usize = 10;

/// Save file data into the content-addressed store and return its file ref:
/// the SHA-256 hex digest plus the original name's extension, if any.
pub async fn save_file<P: AsRef<Path>>(
    base: P,
    data: Bytes,
    original_name: &str,
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(&data);
    let hash = format!("{:x}", hasher.finalize());
    let file_ref = match extension(original_name) {
        Some(ext) => format!("{hash}.{ext}"),
        None => hash,
    };
    let dir = base.as_ref().join(&file_ref[..2]);
    fs::create_dir_all(&dir).await?;
    let path = dir.join(&file_ref);
    if fs::metadata(&path).await.is_err() {
        fs::write(&path, &data).await?;
    }
    debug!(file_ref = %file_ref, size = data.len(), "file stored");
    Ok(file_ref)
}

/// On-disk path for a file ref, or `None` if the ref is malformed.
pub fn file_path<P: AsRef<Path>>(base: P, file_ref: &str) -> Option<PathBuf> {
    if !is_valid_ref(file_ref) {
        return None;
    }
    Some(base.as_ref().join(&file_ref[..2]).join(file_ref))
}

fn extension(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    let ok = !ext.is_empty()
        && ext.len() <= MAX_EXT_LEN
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    ok.then_some(ext)
}

fn is_valid_ref(file_ref: &str) -> bool {
    let (hash, ext) = match file_ref.split_once('.') {
        Some((hash, ext)) => (hash, Some(ext)),
        None => (file_ref, None),
    };
    let hash_ok = hash.len() == 64
        && hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    let ext_ok = ext.map_or(true, |ext| {
        !ext.is_empty()
            && ext.len() <= MAX_EXT_LEN
            && ext
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
    });
    hash_ok && ext_ok
}
