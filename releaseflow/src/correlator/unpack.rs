//! Unpacking downloaded bundles into an isolated scratch area.

use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name each bundle's result document is written to.
pub const RESULT_FILE_NAME: &str = "results.json";

/// Returns true if `data` starts with the gzip magic bytes.
#[must_use]
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Decompresses `data` if it is gzip, otherwise returns it unchanged.
pub fn decode_blob(data: Vec<u8>) -> std::io::Result<Vec<u8>> {
    if !is_gzip(&data) {
        return Ok(data);
    }
    let mut decoder = GzDecoder::new(data.as_slice());
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Turns a bundle name into a single safe path component.
///
/// Separators become `_` and parent references are neutralised, so the
/// result always stays inside its parent directory.
#[must_use]
pub fn sanitize_bundle_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", "_");
    }
    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if cleaned.is_empty() {
        "bundle".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Scratch area private to one correlation of an upstream run.
///
/// Redelivered events share a delivery id, so every area gets a fresh id of
/// its own.
#[derive(Debug, Clone)]
pub struct ScratchArea {
    root: PathBuf,
}

impl ScratchArea {
    /// A fresh area for `run_id` under `scratch_root`.
    #[must_use]
    pub fn new(scratch_root: &Path, run_id: u64) -> Self {
        Self {
            root: scratch_root.join(format!("{run_id}-{}", Uuid::new_v4())),
        }
    }

    /// The directory holding every bundle of this run.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the `index`-th bundle of the run is unpacked to.
    ///
    /// Distinct names can sanitize to the same component, so the listing
    /// position is part of the directory name.
    #[must_use]
    pub fn bundle_dir(&self, index: usize, bundle: &str) -> PathBuf {
        self.root.join(format!("{index}-{}", sanitize_bundle_name(bundle)))
    }

    /// Decodes `blob` and writes it as the `index`-th bundle's result file.
    ///
    /// Returns the bundle directory.
    pub async fn unpack(
        &self,
        index: usize,
        bundle: &str,
        blob: Vec<u8>,
    ) -> std::io::Result<PathBuf> {
        let dir = self.bundle_dir(index, bundle);
        let decoded = decode_blob(blob)?;
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(RESULT_FILE_NAME), decoded).await?;
        Ok(dir)
    }

    /// Removes the area and everything in it.
    pub async fn remove(&self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
