//! On-device inference engine contract.
//!
//! The session manager never talks to a native runtime directly. It goes
//! through [`InferenceEngine`], which exposes exactly three capabilities:
//! construct a context from a local model file, release every live context,
//! and run a single-shot (non-streaming) chat completion.
//!
//! Enable the `llama` feature for a llama.cpp backend ([`LlamaEngine`]).
//!
//! # Example
//!
//! ```no_run
//! use edgechat_engine::{
//!     ChatMessage, CompletionRequest, ContextConfig, InferenceEngine, Role,
//! };
//!
//! async fn ask(engine: &dyn InferenceEngine) -> Result<(), edgechat_engine::EngineError> {
//!     let context = engine
//!         .init_context(ContextConfig::new("/models/qwen2-0.5b-q4.gguf"))
//!         .await?;
//!     let completion = engine
//!         .completion(
//!             &context,
//!             CompletionRequest {
//!                 messages: vec![ChatMessage::new(Role::User, "Hello!")],
//!                 n_predict: 256,
//!                 stop: vec!["</s>".into()],
//!             },
//!         )
//!         .await?;
//!     println!("{:?}", completion.text);
//!     engine.release_all().await
//! }
//! ```

mod message;

#[cfg(feature = "llama")]
mod llama;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use message::{ChatMessage, Role};

#[cfg(feature = "llama")]
pub use llama::LlamaEngine;

/// Errors reported by an inference engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The native backend could not be initialized.
    #[error("Failed to initialize inference backend: {0}")]
    Backend(String),

    /// The model file could not be read or is not a supported format.
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    /// The handle does not refer to a live context (it was released).
    #[error("Context {0} is not active")]
    UnknownContext(Uuid),

    /// Prompt construction, decoding or sampling failed.
    #[error("Inference failed: {0}")]
    Inference(String),

    /// The blocking worker running native code panicked or was cancelled.
    #[error("Engine task failed: {0}")]
    Task(String),
}

/// Parameters used to construct an inference context.
///
/// Values are passed to the backend unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConfig {
    /// Absolute path of the model weights on local storage.
    pub model_path: PathBuf,
    /// Lock weights in RAM so they are never swapped out.
    pub use_mlock: bool,
    /// Context window size in tokens.
    pub n_ctx: u32,
    /// Number of layers offloaded to the GPU.
    pub n_gpu_layers: u32,
}

impl ContextConfig {
    pub const DEFAULT_N_CTX: u32 = 2048;
    pub const DEFAULT_N_GPU_LAYERS: u32 = 1;

    /// Config with the default deployment values for `model_path`.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            use_mlock: true,
            n_ctx: Self::DEFAULT_N_CTX,
            n_gpu_layers: Self::DEFAULT_N_GPU_LAYERS,
        }
    }
}

/// Opaque identifier of a constructed context.
///
/// Handles are cheap to clone; cloning does not duplicate engine resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextHandle {
    id: Uuid,
    model_path: PathBuf,
}

impl ContextHandle {
    /// Mint a handle for a freshly constructed context.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            model_path: model_path.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

/// A single-shot chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    /// Full conversation, system preamble first.
    pub messages: Vec<ChatMessage>,
    /// Upper bound on generated tokens.
    pub n_predict: u32,
    /// Generation halts at the first occurrence of any of these markers.
    pub stop: Vec<String>,
}

/// Result of a completion. `text` is `None` when the backend produced nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub text: Option<String>,
}

/// Capabilities of a native inference runtime.
///
/// `release_all` is process-wide: it frees every context the engine holds,
/// not just one handle. Callers that need single-owner semantics must build
/// them on top.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Load the model at `config.model_path` and construct a context for it.
    async fn init_context(&self, config: ContextConfig) -> Result<ContextHandle, EngineError>;

    /// Release every live context.
    async fn release_all(&self) -> Result<(), EngineError>;

    /// Generate a reply for `request.messages`, stopping at the first stop
    /// marker or after `request.n_predict` tokens. Stop markers are not part
    /// of the returned text.
    async fn completion(
        &self,
        context: &ContextHandle,
        request: CompletionRequest,
    ) -> Result<Completion, EngineError>;
}

/// Byte offset of the earliest stop marker in `text`, if any.
pub fn find_stop_marker(text: &str, stop: &[String]) -> Option<usize> {
    stop.iter()
        .filter(|marker| !marker.is_empty())
        .filter_map(|marker| text.find(marker.as_str()))
        .min()
}
