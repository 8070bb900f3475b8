use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use edgechat_engine::ContextConfig;

const APP_DIR: &str = "edgechat";

/// Fixed system preamble placed at index 0 of every conversation.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "This is a conversation between user and assistant, a friendly chatbot.";

/// End-of-turn markers recognized across the supported model vocabularies.
pub const DEFAULT_STOP_MARKERS: [&str; 8] = [
    "</s>",
    "<|end|>",
    "user:",
    "assistant:",
    "<|im_end|>",
    "<|eot_id|>",
    "<|end of sentence|>",
    "<｜end of sentence｜>",
];

/// Generation cap: effectively "until a stop marker".
pub const DEFAULT_MAX_TOKENS: u32 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
}

// ===== Session Configuration =====

/// Model registry endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    pub base_url: String,
    /// Revision used in download URLs (`{repo}/resolve/{revision}/{file}`)
    pub revision: String,
    pub request_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://huggingface.co".to_string(),
            revision: "main".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Context construction settings, passed to the engine unmodified
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub use_mlock: bool,
    pub context_size: u32,
    pub gpu_layers: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            use_mlock: true,
            context_size: ContextConfig::DEFAULT_N_CTX,
            gpu_layers: ContextConfig::DEFAULT_N_GPU_LAYERS,
        }
    }
}

impl EngineSettings {
    pub fn context_config(&self, model_path: PathBuf) -> ContextConfig {
        ContextConfig {
            model_path,
            use_mlock: self.use_mlock,
            n_ctx: self.context_size,
            n_gpu_layers: self.gpu_layers,
        }
    }
}

/// Completion request settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    pub stop_markers: Vec<String>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            stop_markers: DEFAULT_STOP_MARKERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Session manager configuration (stored locally)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Flat directory holding downloaded artifacts, named as in the registry
    pub storage_root: PathBuf,
    pub registry: RegistryConfig,
    pub engine: EngineSettings,
    pub generation: GenerationSettings,
    pub system_prompt: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            registry: RegistryConfig::default(),
            engine: EngineSettings::default(),
            generation: GenerationSettings::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl SessionConfig {
    /// Default config with artifacts stored under `storage_root`
    pub fn with_storage_root(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }
}

/// `<local data dir>/edgechat/models`
pub fn default_storage_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("models")
}

/// `<config dir>/edgechat/settings.json`
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("settings.json")
}

/// Type-safe configuration key that associates a key name with its value type
#[derive(Debug, Clone, Copy)]
pub struct ConfigKey<T> {
    name: &'static str,
    _phantom: PhantomData<T>,
}

impl<T> ConfigKey<T> {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            _phantom: PhantomData,
        }
    }

    pub fn key_name(&self) -> &'static str {
        self.name
    }
}

impl ConfigKey<SessionConfig> {
    pub const SESSION: Self = Self::new("sessionConfig");
}

// ===== Type-Safe Config Store =====

pub trait ConfigStore {
    fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T>;
    fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError>;
    fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError>;
}

/// Config store persisted as a single JSON object on disk.
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<HashMap<String, serde_json::Value>>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file starts an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Opened settings store at {:?}", path);
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, data: &HashMap<String, serde_json::Value>) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ConfigStore for JsonFileStore {
    fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let value = data.get(key.key_name())?.clone();
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Ignoring invalid value for '{}': {}", key.key_name(), e);
                None
            }
        }
    }

    fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError> {
        let val = serde_json::to_value(value)?;
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.insert(key.key_name().to_string(), val);
        self.save(&data)
    }

    fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.remove(key.key_name());
        self.save(&data)
    }
}

/// Stored session config, or the defaults when nothing is stored yet.
pub fn load_session_config(store: &impl ConfigStore) -> SessionConfig {
    store.get(&ConfigKey::SESSION).unwrap_or_default()
}
