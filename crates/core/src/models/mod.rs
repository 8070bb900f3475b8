pub mod catalog;
mod download;
pub mod registry;
mod storage;

pub use catalog::{
    artifact, list_families, resolve_registry_path, ArtifactDescriptor, ModelFamily,
    ARTIFACT_SUFFIX,
};
pub use download::{DownloadPhase, DownloadPipeline, DownloadState};
pub use registry::{HuggingFaceRegistry, Registry, RegistryError, RegistryFile};
pub use storage::ArtifactStore;

use serde::{Deserialize, Serialize};

/// Runtime status of an artifact - computed, not stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactStatus {
    pub file_name: String,
    /// Does the complete file exist on disk?
    pub is_downloaded: bool,
    /// Is the file currently being downloaded?
    pub is_downloading: bool,
    /// Is the file backing the active context?
    pub is_loaded: bool,
    /// Size of partial download file (for resume support)
    pub downloaded_bytes: u64,
}
