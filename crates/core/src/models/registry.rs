//! Model registry client.
//!
//! [`Registry`] is the seam between the download pipeline and the network.
//! [`HuggingFaceRegistry`] talks to the Hugging Face model API; tests plug in
//! in-memory registries.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::RegistryConfig;

/// Minimum interval between byte-progress callbacks during a transfer
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Network or HTTP failure while talking to the registry
    #[error("{0}")]
    Unavailable(String),
    /// The listing did not have the expected shape
    #[error("{0}")]
    Malformed(String),
    /// The file transfer failed mid-way
    #[error("{0}")]
    Transfer(String),
    #[error("Download cancelled")]
    Cancelled,
}

/// A file published in a registry repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryFile {
    /// Path relative to the repository root
    pub name: String,
    /// Size in bytes, when the registry reports it
    pub size: Option<u64>,
    /// SHA-256 of the content (hex), published for LFS-tracked files
    pub sha256: Option<String>,
}

impl RegistryFile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: None,
            sha256: None,
        }
    }
}

/// A single file transfer.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    /// File the bytes are written to. Appended to when `resume_from > 0`.
    pub destination: &'a Path,
    /// Bytes already present in `destination` from an earlier attempt
    pub resume_from: u64,
    pub cancel: &'a CancellationToken,
}

/// Called with `(bytes on disk, total bytes if known)` as the transfer proceeds.
pub type ByteProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

#[async_trait]
pub trait Registry: Send + Sync {
    /// URL of `file_name` in the repository at `registry_path`.
    fn download_url(&self, registry_path: &str, file_name: &str) -> String;

    /// All files published in the repository, in registry order.
    async fn list_files(&self, registry_path: &str) -> Result<Vec<RegistryFile>, RegistryError>;

    /// Stream `request.url` into `request.destination`.
    async fn fetch_file(
        &self,
        request: FetchRequest<'_>,
        on_bytes: ByteProgress<'_>,
    ) -> Result<(), RegistryError>;
}

// ===== Hugging Face =====

/// Response of `GET /api/models/{repo}`. Only the fields we rely on.
#[derive(Debug, Deserialize)]
struct ModelInfoResponse {
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Deserialize)]
struct LfsInfo {
    sha256: String,
    #[serde(default)]
    size: Option<u64>,
}

/// Decode a model info payload. Fails closed when `siblings` is missing or ill-typed.
pub fn parse_model_info(body: &[u8]) -> Result<Vec<RegistryFile>, RegistryError> {
    let info: ModelInfoResponse = serde_json::from_slice(body)
        .map_err(|e| RegistryError::Malformed(format!("Invalid API response format: {}", e)))?;

    Ok(info
        .siblings
        .into_iter()
        .map(|s| {
            let (lfs_size, sha256) = match s.lfs {
                Some(lfs) => (lfs.size, Some(lfs.sha256)),
                None => (None, None),
            };
            RegistryFile {
                name: s.rfilename,
                size: s.size.or(lfs_size),
                sha256,
            }
        })
        .collect())
}

/// Registry client for the Hugging Face Hub (or a compatible mirror).
pub struct HuggingFaceRegistry {
    client: reqwest::Client,
    base_url: String,
    revision: String,
    request_timeout: Duration,
}

impl HuggingFaceRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        // No overall timeout: model transfers take minutes.
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| RegistryError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            revision: config.revision.clone(),
            request_timeout,
        })
    }

    fn model_info_url(&self, registry_path: &str) -> String {
        format!("{}/api/models/{}?blobs=true", self.base_url, registry_path)
    }

    async fn get(&self, url: &str, range_from: u64) -> Result<reqwest::Response, RegistryError> {
        let mut request = self.client.get(url);
        if range_from > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", range_from));
        }
        request
            .send()
            .await
            .map_err(|e| RegistryError::Transfer(format!("Failed to start download: {}", e)))
    }
}

#[async_trait]
impl Registry for HuggingFaceRegistry {
    fn download_url(&self, registry_path: &str, file_name: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.base_url, registry_path, self.revision, file_name
        )
    }

    async fn list_files(&self, registry_path: &str) -> Result<Vec<RegistryFile>, RegistryError> {
        let url = self.model_info_url(registry_path);
        debug!("Listing registry files: {}", url);

        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Unavailable(format!(
                "Registry returned status: {}",
                status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RegistryError::Unavailable(format!("Failed to read response: {}", e)))?;

        parse_model_info(&body)
    }

    async fn fetch_file(
        &self,
        request: FetchRequest<'_>,
        on_bytes: ByteProgress<'_>,
    ) -> Result<(), RegistryError> {
        let mut offset = request.resume_from;
        let mut response = self.get(request.url, offset).await?;

        if offset > 0 && response.status() == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            warn!("Server rejected resume at {} bytes, restarting", offset);
            offset = 0;
            response = self.get(request.url, 0).await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Transfer(format!(
                "Download failed with status: {}",
                status
            )));
        }

        if offset > 0 && status != reqwest::StatusCode::PARTIAL_CONTENT {
            info!("Server ignored range request, restarting from 0");
            offset = 0;
        }
        if offset > 0 {
            info!("Resuming {} from {} bytes", request.url, offset);
        }

        let total = response.content_length().map(|len| len + offset);

        // Open file for appending (if resuming) or create new
        let file = if offset > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(request.destination)
                .await
                .map_err(|e| RegistryError::Transfer(format!("Failed to open file for append: {}", e)))?
        } else {
            tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(request.destination)
                .await
                .map_err(|e| RegistryError::Transfer(format!("Failed to create file: {}", e)))?
        };

        let mut file = tokio::io::BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut written = offset;
        let mut last_emit = Instant::now();

        loop {
            let chunk = tokio::select! {
                _ = request.cancel.cancelled() => {
                    let _ = file.flush().await;
                    return Err(RegistryError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| RegistryError::Transfer(format!("Download error: {}", e)))?;

            file.write_all(&chunk)
                .await
                .map_err(|e| RegistryError::Transfer(format!("Failed to write chunk: {}", e)))?;
            written += chunk.len() as u64;

            if last_emit.elapsed() >= PROGRESS_INTERVAL {
                on_bytes(written, total);
                last_emit = Instant::now();
            }
        }

        file.flush()
            .await
            .map_err(|e| RegistryError::Transfer(format!("Failed to flush file: {}", e)))?;

        if let Some(total) = total {
            if written != total {
                return Err(RegistryError::Transfer(format!(
                    "Connection closed after {} of {} bytes",
                    written, total
                )));
            }
        }

        on_bytes(written, total);
        Ok(())
    }
}
