use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::catalog::{is_artifact_file, resolve_registry_path};
use super::registry::{FetchRequest, Registry, RegistryError, RegistryFile};
use super::storage::ArtifactStore;
use super::ArtifactStatus;
use crate::error::SessionError;
use crate::events::{DownloadStateChanged, EventBus};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum DownloadPhase {
    #[default]
    Idle,
    Listing,
    Downloading,
    Verifying,
    Done,
    Failed,
}

/// Byte progress is capped here until verification and the final rename succeed.
const MAX_TRANSFER_PROGRESS: f64 = 0.99;

/// Progress of the most recent listing or download.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadState {
    pub phase: DownloadPhase,
    /// 0.0..=1.0, non-decreasing within one download
    pub progress: f64,
    pub selected_file: Option<String>,
}

/// Resolves, downloads and caches model artifacts.
///
/// Does NOT load models into memory - that's the session lifecycle's job.
pub struct DownloadPipeline {
    registry: Arc<dyn Registry>,
    store: ArtifactStore,
    events: EventBus,
    state: Mutex<DownloadState>,
    /// Bumped by every listing/download; stale operations stop updating `state`
    epoch: AtomicU64,
    /// Registry metadata from the latest listings, by file name
    known_files: Mutex<HashMap<String, RegistryFile>>,
    /// Cancellation tokens for active downloads
    cancel_tokens: Mutex<HashMap<String, CancellationToken>>,
}

/// Removes the cancellation token of a download on every exit path.
///
/// Dropped while `armed` means the caller abandoned the download future;
/// the visible state is marked failed so the file can be retried.
struct TransferGuard<'a> {
    pipeline: &'a DownloadPipeline,
    file_name: &'a str,
    epoch: u64,
    armed: bool,
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        self.pipeline
            .cancel_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.file_name);
        if self.armed {
            warn!("Download of '{}' abandoned by caller", self.file_name);
            self.pipeline
                .update(self.epoch, |s| s.phase = DownloadPhase::Failed);
        }
    }
}

impl DownloadPipeline {
    pub fn new(registry: Arc<dyn Registry>, store: ArtifactStore, events: EventBus) -> Self {
        Self {
            registry,
            store,
            events,
            state: Mutex::new(DownloadState::default()),
            epoch: AtomicU64::new(0),
            known_files: Mutex::new(HashMap::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Start a new operation: bump the epoch and reset the visible state.
    fn begin(&self, phase: DownloadPhase, selected_file: Option<String>) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = DownloadState {
            phase,
            progress: 0.0,
            selected_file,
        };
        epoch
    }

    /// Apply `f` to the visible state if `epoch` is still the latest operation.
    fn update(&self, epoch: u64, f: impl FnOnce(&mut DownloadState)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.epoch.load(Ordering::SeqCst) == epoch {
            f(&mut state);
        } else {
            debug!("Ignoring state update from superseded operation {}", epoch);
        }
    }

    /// Artifact files published for `family_id`, in registry order.
    pub async fn list_artifacts(&self, family_id: &str) -> Result<Vec<String>, SessionError> {
        let registry_path = resolve_registry_path(family_id)?;
        let epoch = self.begin(DownloadPhase::Listing, None);
        info!("Fetching artifacts for '{}' from {}", family_id, registry_path);

        let result = self.registry.list_files(registry_path).await;

        match result {
            Ok(files) => {
                let artifacts: Vec<RegistryFile> = files
                    .into_iter()
                    .filter(|f| is_artifact_file(&f.name))
                    .collect();
                info!("Found {} artifact(s) for '{}'", artifacts.len(), family_id);

                let names = artifacts.iter().map(|f| f.name.clone()).collect();
                {
                    let mut known = self
                        .known_files
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    for file in artifacts {
                        known.insert(file.name.clone(), file);
                    }
                }
                self.update(epoch, |s| s.phase = DownloadPhase::Idle);
                Ok(names)
            }
            Err(e) => {
                error!("Listing artifacts for '{}' failed: {}", family_id, e);
                self.update(epoch, |s| s.phase = DownloadPhase::Failed);
                Err(match e {
                    RegistryError::Malformed(msg) => SessionError::MalformedRegistryResponse(msg),
                    other => SessionError::RegistryUnavailable(other.to_string()),
                })
            }
        }
    }

    /// Download `file_name` of `family_id` into the store, returning its local path.
    ///
    /// Returns immediately, without any transfer, when the file is already
    /// present. `on_progress` receives strictly increasing fractions.
    pub async fn download_artifact<F>(
        &self,
        family_id: &str,
        file_name: &str,
        on_progress: F,
    ) -> Result<PathBuf, SessionError>
    where
        F: Fn(f64) + Send + Sync,
    {
        let registry_path = resolve_registry_path(family_id)?;
        let destination = self
            .store
            .path_for(file_name)
            .ok_or_else(|| SessionError::DownloadFailed(format!("Invalid file name: {}", file_name)))?;

        // Pre-flight: the final file only exists after a completed transfer
        if destination.is_file() {
            info!("Artifact '{}' already downloaded", file_name);
            let epoch = self.begin(DownloadPhase::Done, Some(file_name.to_string()));
            self.update(epoch, |s| s.progress = 1.0);
            on_progress(1.0);
            self.events.emit(DownloadStateChanged::Complete {
                file_name: file_name.to_string(),
                path: destination.to_string_lossy().to_string(),
            });
            return Ok(destination);
        }

        let cancel_token = CancellationToken::new();
        {
            let mut tokens = self
                .cancel_tokens
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if tokens.contains_key(file_name) {
                warn!("Artifact '{}' is already being downloaded", file_name);
                return Err(SessionError::DownloadFailed(format!(
                    "{} is already being downloaded",
                    file_name
                )));
            }
            tokens.insert(file_name.to_string(), cancel_token.clone());
        }

        let epoch = self.begin(DownloadPhase::Downloading, Some(file_name.to_string()));
        let mut guard = TransferGuard {
            pipeline: self,
            file_name,
            epoch,
            armed: true,
        };
        info!("Starting download of '{}' from {}", file_name, registry_path);

        let result = self
            .transfer(
                epoch,
                registry_path,
                file_name,
                &destination,
                &cancel_token,
                &on_progress,
            )
            .await;
        guard.armed = false;
        drop(guard);

        match result {
            Ok(()) => {
                info!("Download complete: {}", file_name);
                self.update(epoch, |s| {
                    s.phase = DownloadPhase::Done;
                    s.progress = 1.0;
                });
                self.events.emit(DownloadStateChanged::Complete {
                    file_name: file_name.to_string(),
                    path: destination.to_string_lossy().to_string(),
                });
                Ok(destination)
            }
            Err(e) => {
                error!("Download failed: {}", e);
                self.update(epoch, |s| s.phase = DownloadPhase::Failed);
                self.events.emit(DownloadStateChanged::Error {
                    file_name: file_name.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        epoch: u64,
        registry_path: &str,
        file_name: &str,
        destination: &Path,
        cancel_token: &CancellationToken,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), SessionError> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SessionError::DownloadFailed(format!("Failed to create model directory: {}", e))
            })?;
        }

        let url = self.registry.download_url(registry_path, file_name);
        let partial_path = ArtifactStore::partial_path(destination);
        let resume_from = tokio::fs::metadata(&partial_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let known = self
            .known_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(file_name)
            .cloned();
        let known_size = known.as_ref().and_then(|f| f.size);

        let last_reported = Mutex::new(0.0_f64);
        let report = |fraction: f64| {
            let fraction = fraction.clamp(0.0, 1.0);
            {
                let mut last = last_reported.lock().unwrap_or_else(PoisonError::into_inner);
                if fraction <= *last {
                    return;
                }
                *last = fraction;
            }
            self.update(epoch, |s| s.progress = fraction);
            on_progress(fraction);
            self.events.emit(DownloadStateChanged::Progress {
                file_name: file_name.to_string(),
                progress: fraction,
            });
        };
        // Only the finalized file reports 1.0
        let on_bytes = |downloaded: u64, total: Option<u64>| {
            if let Some(total) = total.or(known_size).filter(|t| *t > 0) {
                debug!("Download progress: {}/{} bytes", downloaded, total);
                report((downloaded as f64 / total as f64).min(MAX_TRANSFER_PROGRESS));
            }
        };

        let fetched = self
            .registry
            .fetch_file(
                FetchRequest {
                    url: &url,
                    destination: &partial_path,
                    resume_from,
                    cancel: cancel_token,
                },
                &on_bytes,
            )
            .await;

        match fetched {
            Ok(()) if !cancel_token.is_cancelled() => {}
            Ok(()) | Err(RegistryError::Cancelled) => {
                let _ = tokio::fs::remove_file(&partial_path).await;
                return Err(SessionError::DownloadFailed("Download cancelled".to_string()));
            }
            Err(e) => {
                // Partial file is kept so the next attempt can resume
                return Err(SessionError::DownloadFailed(e.to_string()));
            }
        }

        if let Some(expected) = known.as_ref().and_then(|f| f.sha256.as_deref()) {
            info!("Verifying checksum of '{}'", file_name);
            self.update(epoch, |s| s.phase = DownloadPhase::Verifying);
            self.events.emit(DownloadStateChanged::Verifying {
                file_name: file_name.to_string(),
            });

            if let Err(e) = verify_checksum(&partial_path, expected).await {
                let _ = tokio::fs::remove_file(&partial_path).await;
                return Err(SessionError::DownloadFailed(format!(
                    "Checksum verification failed: {}",
                    e
                )));
            }
        }

        tokio::fs::rename(&partial_path, destination)
            .await
            .map_err(|e| SessionError::DownloadFailed(format!("Failed to finalize {}: {}", file_name, e)))?;

        report(1.0);
        Ok(())
    }

    /// Cancel an ongoing download. Returns false if `file_name` is not downloading.
    pub fn cancel_download(&self, file_name: &str) -> bool {
        let tokens = self
            .cancel_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match tokens.get(file_name) {
            Some(token) => {
                token.cancel();
                info!("Cancellation requested for '{}'", file_name);
                true
            }
            None => {
                debug!("No active download for '{}'", file_name);
                false
            }
        }
    }

    /// Cancel every active download.
    pub fn cancel_all(&self) {
        let tokens = self
            .cancel_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (file_name, token) in tokens.iter() {
            info!("Cancelling download of '{}'", file_name);
            token.cancel();
        }
    }

    /// Local path of `file_name` if it is fully downloaded.
    pub fn local_path(&self, file_name: &str) -> Option<PathBuf> {
        self.store.existing_path(file_name)
    }

    pub fn is_downloaded(&self, file_name: &str) -> bool {
        self.store.contains(file_name)
    }

    pub fn artifact_status(&self, file_name: &str, loaded_file: Option<&str>) -> ArtifactStatus {
        ArtifactStatus {
            file_name: file_name.to_string(),
            is_downloaded: self.is_downloaded(file_name),
            is_downloading: self.is_downloading(file_name),
            is_loaded: loaded_file == Some(file_name),
            downloaded_bytes: self.store.partial_len(file_name),
        }
    }

    pub fn is_downloading(&self, file_name: &str) -> bool {
        self.cancel_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(file_name)
    }
}

/// Verify SHA-256 checksum of a downloaded file.
async fn verify_checksum(file_path: &Path, expected_hash: &str) -> Result<(), String> {
    let mut file = tokio::fs::File::open(file_path)
        .await
        .map_err(|e| format!("Failed to open file for verification: {}", e))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .await
            .map_err(|e| format!("Failed to read file for verification: {}", e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let computed_hash = format!("{:x}", hasher.finalize());
    if !computed_hash.eq_ignore_ascii_case(expected_hash) {
        return Err(format!(
            "Hash mismatch: expected {}, got {}",
            expected_hash, computed_hash
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checksum_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.bin");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let sha = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        assert!(verify_checksum(&path, sha).await.is_ok());
        assert!(verify_checksum(&path, &sha.to_uppercase()).await.is_ok());

        let err = verify_checksum(&path, "00").await.unwrap_err();
        assert!(err.starts_with("Hash mismatch"), "{}", err);
    }

    #[test]
    fn phases_display_in_camel_case() {
        assert_eq!(DownloadPhase::Downloading.to_string(), "downloading");
        assert_eq!(DownloadState::default().phase, DownloadPhase::Idle);
    }
}
