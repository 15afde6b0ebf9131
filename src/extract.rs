//! Archive extraction
//!
//! ZIP extraction used for local-archive override installs and patch tool
//! bundles. Entry paths are sanitized via the archive's enclosed names so
//! a crafted archive cannot escape the destination directory.

use crate::error::{Error, PatchError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Extract a ZIP archive into `dest_dir`, returning the extracted files
pub async fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
    let archive_path = archive_path.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_zip_sync(&archive_path, &dest_dir))
        .await
        .map_err(|e| std::io::Error::other(format!("extraction task panicked: {e}")))?
}

fn extract_zip_sync(archive_path: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
    debug!(
        archive = %archive_path.display(),
        dest = %dest_dir.display(),
        "extracting ZIP archive"
    );

    std::fs::create_dir_all(dest_dir)?;

    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        Error::Patch(PatchError::BinaryPatchFailed {
            path: archive_path.to_path_buf(),
            reason: format!("failed to read ZIP archive: {e}"),
        })
    })?;

    let mut extracted = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| {
            Error::Patch(PatchError::BinaryPatchFailed {
                path: archive_path.to_path_buf(),
                reason: format!("failed to read ZIP entry {index}: {e}"),
            })
        })?;

        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!(entry = entry.name(), "skipping entry with unsafe path");
            continue;
        };
        let out_path = dest_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;
        extracted.push(out_path);
    }

    info!(
        archive = %archive_path.display(),
        extracted_count = extracted.len(),
        "ZIP extraction successful"
    );
    Ok(extracted)
}
