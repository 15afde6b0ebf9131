//! Streaming file hashing
//!
//! Computes MD5, SHA-1 and SHA-256 digests plus the file size in a single
//! pass with an 8 MiB read buffer. Digesting runs on the blocking thread
//! pool so large game payloads do not stall the async executor.

use crate::error::Result;
use crate::types::FileHash;
use sha1::Digest as _;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Read chunk size for streaming digests
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Compute all three digests and the size of a file in one pass
///
/// Deterministic: re-reading a stable file produces identical output.
/// Fails only on I/O; I/O errors propagate unchanged.
pub async fn hash_file(path: &Path) -> Result<FileHash> {
    let path = path.to_path_buf();
    let hash = tokio::task::spawn_blocking(move || hash_file_sync(&path))
        .await
        .map_err(|e| std::io::Error::other(format!("hash task panicked: {e}")))??;
    Ok(hash)
}

/// Compute only the SHA-256 digest and size of a file
///
/// Cheaper single-digest variant used on verification paths where the
/// full [`FileHash`] is not needed.
pub async fn sha256_file(path: &Path) -> Result<(u64, String)> {
    let path = path.to_path_buf();
    let out = tokio::task::spawn_blocking(move || sha256_file_sync(&path))
        .await
        .map_err(|e| std::io::Error::other(format!("hash task panicked: {e}")))??;
    Ok(out)
}

/// Check a file against an expected hash (size and SHA-256)
///
/// Returns `Ok(false)` when the file is missing or its content differs;
/// propagates other I/O errors.
pub async fn verify_file(path: &Path, expected: &FileHash) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() != expected.size => {
            debug!(
                path = %path.display(),
                on_disk = meta.len(),
                expected = expected.size,
                "size mismatch, skipping digest"
            );
            return Ok(false);
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let (_, sha256) = sha256_file(path).await?;
    Ok(sha256 == expected.sha256)
}

fn hash_file_sync(path: &Path) -> std::io::Result<FileHash> {
    let mut file = std::fs::File::open(path)?;
    let mut md5 = md5::Context::new();
    let mut sha1 = sha1::Sha1::new();
    let mut sha256 = sha2::Sha256::new();
    let mut size: u64 = 0;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        md5.consume(&buf[..n]);
        sha1.update(&buf[..n]);
        sha256.update(&buf[..n]);
        size += n as u64;
    }

    Ok(FileHash {
        size,
        md5: format!("{:x}", md5.compute()),
        sha1: hex::encode(sha1.finalize()),
        sha256: hex::encode(sha256.finalize()),
    })
}

fn sha256_file_sync(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = std::fs::File::open(path)?;
    let mut sha256 = sha2::Sha256::new();
    let mut size: u64 = 0;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha256.update(&buf[..n]);
        size += n as u64;
    }

    Ok((size, hex::encode(sha256.finalize())))
}
