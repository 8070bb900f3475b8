use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Only files with this suffix are offered for download.
pub const ARTIFACT_SUFFIX: &str = ".gguf";

/// A selectable model family and the registry repository that publishes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelFamily {
    /// Identifier shown to the user (e.g., "Qwen2-0.5B-Instruct")
    pub id: &'static str,
    /// Registry repository path (e.g., "medmekk/Qwen2.5-0.5B-Instruct.GGUF")
    pub registry_path: &'static str,
}

/// A single downloadable artifact within a family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    pub family_id: String,
    pub registry_path: String,
    /// Registry file name; also the local storage key
    pub file_name: String,
}

/// Hardcoded catalog of selectable families, in display order
static FAMILIES: [ModelFamily; 4] = [
    ModelFamily {
        id: "Llama-3.2-1B-Instruct",
        registry_path: "medmekk/Llama-3.2-1B-Instruct.GGUF",
    },
    ModelFamily {
        id: "Qwen2-0.5B-Instruct",
        registry_path: "medmekk/Qwen2.5-0.5B-Instruct.GGUF",
    },
    ModelFamily {
        id: "DeepSeek-R1-Distill-Qwen-1.5B",
        registry_path: "medmekk/DeepSeek-R1-Distill-Qwen-1.5B.GGUF",
    },
    ModelFamily {
        id: "SmolLM2-1.7B-Instruct",
        registry_path: "medmekk/SmolLM2-1.7B-Instruct.GGUF",
    },
];

/// Family identifiers in display order.
pub fn list_families() -> Vec<&'static str> {
    FAMILIES.iter().map(|f| f.id).collect()
}

pub fn resolve_registry_path(family_id: &str) -> Result<&'static str, SessionError> {
    FAMILIES
        .iter()
        .find(|f| f.id == family_id)
        .map(|f| f.registry_path)
        .ok_or_else(|| SessionError::UnknownFamily(family_id.to_string()))
}

pub fn artifact(family_id: &str, file_name: &str) -> Result<ArtifactDescriptor, SessionError> {
    Ok(ArtifactDescriptor {
        family_id: family_id.to_string(),
        registry_path: resolve_registry_path(family_id)?.to_string(),
        file_name: file_name.to_string(),
    })
}

pub fn is_artifact_file(file_name: &str) -> bool {
    file_name.ends_with(ARTIFACT_SUFFIX)
}
