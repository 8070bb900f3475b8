use std::path::{Component, Path, PathBuf};

use log::warn;

use super::catalog::is_artifact_file;

const PARTIAL_SUFFIX: &str = ".partial";

/// Flat on-disk artifact store.
///
/// Artifacts live directly below the root, named exactly as the registry
/// names them. The existence of the final file is the "already downloaded"
/// index; in-progress transfers use a `.partial` sibling so they never pass
/// that check.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path for `file_name`, or `None` if the name would escape the root.
    pub fn path_for(&self, file_name: &str) -> Option<PathBuf> {
        let relative = Path::new(file_name);
        let is_plain = !file_name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        is_plain.then(|| self.root.join(relative))
    }

    /// Path shown in messages, even for names `path_for` rejects.
    pub fn display_path(&self, file_name: &str) -> String {
        self.root.join(file_name).to_string_lossy().to_string()
    }

    pub fn partial_path(destination: &Path) -> PathBuf {
        let mut name = destination.as_os_str().to_owned();
        name.push(PARTIAL_SUFFIX);
        PathBuf::from(name)
    }

    /// The artifact's path if it is fully present on disk.
    pub fn existing_path(&self, file_name: &str) -> Option<PathBuf> {
        self.path_for(file_name).filter(|path| path.is_file())
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.existing_path(file_name).is_some()
    }

    /// Size of a resumable partial download.
    pub fn partial_len(&self, file_name: &str) -> u64 {
        self.path_for(file_name)
            .map(|path| Self::partial_path(&path))
            .and_then(|partial| partial.metadata().ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Completed artifacts below the root, as registry-style relative names, sorted.
    pub fn list_downloaded(&self) -> Vec<String> {
        let mut found = Vec::new();
        self.collect(&self.root, &mut found);
        found.sort();
        found
    }

    fn collect(&self, dir: &Path, found: &mut Vec<String>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read {:?}: {}", dir, e);
                }
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.collect(&path, found);
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if is_artifact_file(&name) {
                found.push(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_names_escaping_the_root() {
        let store = ArtifactStore::new("/models");
        assert_eq!(
            store.path_for("qwen.gguf"),
            Some(PathBuf::from("/models/qwen.gguf"))
        );
        assert_eq!(
            store.path_for("Q4/qwen.gguf"),
            Some(PathBuf::from("/models/Q4/qwen.gguf"))
        );
        assert_eq!(store.path_for("../etc/passwd"), None);
        assert_eq!(store.path_for("/etc/passwd"), None);
        assert_eq!(store.path_for(""), None);
    }

    #[test]
    fn partial_files_are_not_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let path = store.path_for("a.gguf").unwrap();

        std::fs::write(ArtifactStore::partial_path(&path), b"12345").unwrap();
        assert!(!store.contains("a.gguf"));
        assert_eq!(store.partial_len("a.gguf"), 5);
        assert!(store.list_downloaded().is_empty());

        std::fs::write(&path, b"done").unwrap();
        assert!(store.contains("a.gguf"));
    }

    #[test]
    fn lists_nested_artifacts_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("Q8")).unwrap();
        std::fs::write(dir.path().join("b.gguf"), b"").unwrap();
        std::fs::write(dir.path().join("Q8").join("a.gguf"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        assert_eq!(store.list_downloaded(), vec!["Q8/a.gguf", "b.gguf"]);
    }

    #[test]
    fn missing_root_lists_nothing() {
        let store = ArtifactStore::new("/definitely/not/here");
        assert!(store.list_downloaded().is_empty());
        assert!(!store.contains("a.gguf"));
    }
}
