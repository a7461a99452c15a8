// ABOUTME: Dedup-aware transfer of manifest entries and archive expansion
// ABOUTME: Skips basenames already on disk and unpacks period archives exactly once

use flate2::read::GzDecoder;
use std::fs;
use std::path::PathBuf;

use crate::auth::AccessToken;
use crate::period::Period;

use super::client::{FeedClient, TransferError};
use super::models::ManifestEntry;

const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Decides which manifest entries are new, streams them to local storage
/// and expands period archives into one directory per period.
pub struct DataPuller {
    client: FeedClient,
    data_dir: PathBuf,
}

impl DataPuller {
    pub fn new(client: FeedClient, data_dir: PathBuf) -> Self {
        Self { client, data_dir }
    }

    /// Whether the entry still has to be transferred.
    ///
    /// A file with the entry's basename at the destination counts as
    /// already transferred; the content is not re-validated.
    pub fn needs_download(&self, entry: &ManifestEntry) -> bool {
        !self.dest_for(entry).exists()
    }

    /// Fetch the manifest and transfer only the chronologically last
    /// delta entry. Returns `None` when no deltas are published.
    pub async fn pull_latest_delta(
        &self,
        token: &AccessToken,
    ) -> Result<Option<PathBuf>, TransferError> {
        let manifest = self.client.manifest(token).await?;
        let Some(entry) = manifest.latest_delta() else {
            tracing::info!("no delta files available");
            return Ok(None);
        };
        Ok(Some(self.fetch(entry).await?))
    }

    /// Fetch the manifest and transfer every bulk entry.
    pub async fn pull_bulk(&self, token: &AccessToken) -> Result<Vec<PathBuf>, TransferError> {
        let manifest = self.client.manifest(token).await?;
        self.fetch_all(&manifest.bulk, "bulk").await
    }

    /// Fetch the manifest and transfer every delta entry.
    pub async fn pull_deltas(&self, token: &AccessToken) -> Result<Vec<PathBuf>, TransferError> {
        let manifest = self.client.manifest(token).await?;
        self.fetch_all(&manifest.delta, "delta").await
    }

    /// Expand every period archive in the data directory into a
    /// directory named after the period. See [`expand_archives`].
    pub fn expand_archives(&self) -> Result<Vec<PathBuf>, TransferError> {
        expand_archives(&self.data_dir)
    }

    fn dest_for(&self, entry: &ManifestEntry) -> PathBuf {
        self.data_dir.join(entry.basename())
    }

    async fn fetch(&self, entry: &ManifestEntry) -> Result<PathBuf, TransferError> {
        fs::create_dir_all(&self.data_dir)
            .map_err(|e| TransferError::storage(&self.data_dir, e))?;

        let dest = self.dest_for(entry);
        if dest.exists() {
            tracing::info!("skipping {} (already transferred)", entry.basename());
            return Ok(dest);
        }

        self.client.download(entry, &dest).await?;
        tracing::info!("saved {:?}", dest);
        Ok(dest)
    }

    async fn fetch_all(
        &self,
        entries: &[ManifestEntry],
        label: &str,
    ) -> Result<Vec<PathBuf>, TransferError> {
        if entries.is_empty() {
            tracing::info!("no {} files available", label);
            return Ok(Vec::new());
        }

        let mut transferred = Vec::new();
        for entry in entries {
            transferred.push(self.fetch(entry).await?);
        }
        tracing::info!(
            "transferred {}/{} {} files",
            transferred.len(),
            entries.len(),
            label
        );
        Ok(transferred)
    }
}

/// Expand every period archive in `data_dir` into a directory named
/// after the period.
///
/// Expansion is skipped when the destination directory already exists;
/// the archive is removed only after a successful unpack, so an
/// interrupted expansion is retried on the next run. Needs no feed
/// client, only local storage.
pub fn expand_archives(data_dir: &std::path::Path) -> Result<Vec<PathBuf>, TransferError> {
    let mut archives = Vec::new();
    if data_dir.exists() {
        let entries = fs::read_dir(data_dir).map_err(|e| TransferError::storage(data_dir, e))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(ARCHIVE_SUFFIX) && Period::parse(&name).is_some() {
                archives.push(entry.path());
            }
        }
    }
    archives.sort();

    let mut expanded = Vec::new();
    for archive in archives {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem = name.trim_end_matches(ARCHIVE_SUFFIX);
        let dest = data_dir.join(stem);

        if dest.exists() {
            tracing::info!("skipping {} (already expanded)", name);
            expanded.push(dest);
            continue;
        }

        tracing::info!("expanding {} into {:?}", name, dest);
        fs::create_dir_all(&dest).map_err(|e| TransferError::storage(&dest, e))?;

        let file = fs::File::open(&archive).map_err(|e| TransferError::storage(&archive, e))?;
        let mut unpacker = tar::Archive::new(GzDecoder::new(file));
        unpacker
            .unpack(&dest)
            .map_err(|e| TransferError::storage(&archive, e))?;

        fs::remove_file(&archive).map_err(|e| TransferError::storage(&archive, e))?;
        expanded.push(dest);
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedConfig;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    fn test_puller(data_dir: PathBuf) -> DataPuller {
        let client = FeedClient::new(FeedConfig {
            manifest_url: "https://feed.example.com/manifest".to_string(),
            api_key: "key".to_string(),
        })
        .unwrap();
        DataPuller::new(client, data_dir)
    }

    fn entry(filename: &str) -> ManifestEntry {
        ManifestEntry {
            filename: filename.to_string(),
            download_url: format!("https://cdn.example.com/{}", filename),
            file_size: 10,
        }
    }

    /// Build a small gzipped tar holding the given (name, contents) members.
    fn write_archive(path: &std::path::Path, members: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
    }

    #[test]
    fn test_needs_download_skips_existing_basename() {
        let dir = tempdir().unwrap();
        let puller = test_puller(dir.path().to_path_buf());

        let e = entry("delta_10-01-2026.json.gz");
        assert!(puller.needs_download(&e));

        // A file with the same basename, whatever its content, wins.
        fs::write(dir.path().join("delta_10-01-2026.json.gz"), b"truncated").unwrap();
        assert!(!puller.needs_download(&e));
    }

    #[test]
    fn test_expand_archives_unpacks_and_removes_archive() {
        let dir = tempdir().unwrap();
        let puller = test_puller(dir.path().to_path_buf());

        let archive = dir.path().join("delta-light-vehicle_02-02-2026.tar.gz");
        write_archive(
            &archive,
            &[("part-000.json.gz", "a"), ("part-001.json.gz", "b")],
        );

        let expanded = puller.expand_archives().unwrap();
        assert_eq!(expanded.len(), 1);
        let period_dir = dir.path().join("delta-light-vehicle_02-02-2026");
        assert!(period_dir.is_dir());
        assert!(period_dir.join("part-000.json.gz").exists());
        assert!(period_dir.join("part-001.json.gz").exists());
        assert!(!archive.exists());
    }

    #[test]
    fn test_expand_archives_skips_existing_directory() {
        let dir = tempdir().unwrap();
        let puller = test_puller(dir.path().to_path_buf());

        let archive = dir.path().join("bulk-light-vehicle_02-02-2026.tar.gz");
        write_archive(&archive, &[("part-000.json.gz", "a")]);
        fs::create_dir(dir.path().join("bulk-light-vehicle_02-02-2026")).unwrap();

        let expanded = puller.expand_archives().unwrap();
        assert_eq!(expanded.len(), 1);
        // Skipped expansion leaves the archive in place
        assert!(archive.exists());
    }

    #[test]
    fn test_expand_archives_ignores_unrelated_files() {
        let dir = tempdir().unwrap();
        let puller = test_puller(dir.path().to_path_buf());

        fs::write(dir.path().join("notes.tar.gz"), b"not a period").unwrap();
        fs::write(dir.path().join("delta_10-01-2026.json.gz"), b"loose").unwrap();

        let expanded = puller.expand_archives().unwrap();
        assert!(expanded.is_empty());
        assert!(dir.path().join("notes.tar.gz").exists());
    }
}
