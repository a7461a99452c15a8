// ABOUTME: HTTP client for the manifest endpoint and artifact downloads
// ABOUTME: Streams bodies to their final path with byte progress reporting

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::auth::AccessToken;
use crate::config::FeedConfig;

use super::models::{Manifest, ManifestEntry};

/// Transfer failures. A network or storage failure mid-download leaves a
/// truncated file at the destination that the next run will treat as
/// already transferred; dedup is basename-only with no integrity check.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("feed request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("feed rejected credentials (401); the access token or API key may be invalid")]
    Unauthorized,
    #[error("feed returned status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("local storage I/O at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl TransferError {
    pub(crate) fn storage(path: &Path, source: std::io::Error) -> Self {
        TransferError::Storage {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// HTTP access to the feed: manifest fetch and artifact download.
pub struct FeedClient {
    http: reqwest::Client,
    config: FeedConfig,
}

impl FeedClient {
    /// Build the client. No total request timeout is set because bulk
    /// artifacts can take a long time to stream; only connecting is
    /// bounded.
    pub fn new(config: FeedConfig) -> Result<Self, TransferError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, config })
    }

    /// Fetch and deserialize the bulk-download manifest.
    pub async fn manifest(&self, token: &AccessToken) -> Result<Manifest, TransferError> {
        tracing::info!("requesting manifest from {}", self.config.manifest_url);

        let response = self
            .http
            .get(&self.config.manifest_url)
            .bearer_auth(&token.value)
            .header("x-api-key", &self.config.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransferError::Unauthorized);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Status { status, body });
        }

        let manifest: Manifest = response.json().await?;
        tracing::info!(
            "manifest lists {} bulk and {} delta entries",
            manifest.bulk.len(),
            manifest.delta.len()
        );
        Ok(manifest)
    }

    /// Stream one manifest entry to `dest`.
    ///
    /// The body is written directly to the final path; a crash partway
    /// through leaves a truncated file behind (accepted failure mode, see
    /// [`TransferError`]).
    pub async fn download(
        &self,
        entry: &ManifestEntry,
        dest: &Path,
    ) -> Result<(), TransferError> {
        let response = self.http.get(&entry.download_url).send().await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransferError::Unauthorized);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Status { status, body });
        }

        let total = response.content_length().unwrap_or(entry.file_size);
        let bar = byte_progress_bar(total, entry.basename());

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| TransferError::storage(dest, e))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::storage(dest, e))?;
            bar.inc(chunk.len() as u64);
        }

        file.flush()
            .await
            .map_err(|e| TransferError::storage(dest, e))?;
        bar.finish_and_clear();
        Ok(())
    }
}

pub(crate) fn byte_progress_bar(total: u64, message: &str) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(
            "  {msg} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message(message.to_string());
    bar
}
