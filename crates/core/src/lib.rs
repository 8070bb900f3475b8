//! On-device model session manager.
//!
//! Lists GGUF artifacts for a fixed catalog of model families, downloads them
//! into a local store, keeps at most one inference context alive and runs a
//! single conversation against it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use edgechat::ModelSessionManager;
//! # async fn run(engine: Arc<dyn edgechat::InferenceEngine>) -> Result<(), edgechat::Error> {
//! edgechat::logging::init();
//!
//! let manager = ModelSessionManager::with_default_settings(engine)?;
//! let files = manager.list_artifacts("Qwen2-0.5B-Instruct").await?;
//! manager
//!     .download_artifact("Qwen2-0.5B-Instruct", &files[0], |p| println!("{:.0}%", p * 100.0))
//!     .await?;
//! manager.load_model(&files[0]).await?;
//! println!("{}", manager.send_message("Hello!").await?);
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod conversation;
pub mod error;
pub mod events;
pub mod logging;
mod manager;
pub mod models;
mod session;

pub use config::{ConfigError, ConfigKey, ConfigStore, JsonFileStore, SessionConfig};
pub use conversation::ConversationState;
pub use error::{Error, Result, SessionError};
pub use events::{
    DownloadStateChanged, EventBus, GenerationStateChanged, ModelLoadingStateChanged, SessionEvent,
};
pub use manager::ModelSessionManager;
pub use models::{ArtifactStatus, DownloadPhase, DownloadState};
pub use session::{SessionPhase, SessionState};

pub use edgechat_engine::{
    ChatMessage, Completion, CompletionRequest, ContextConfig, ContextHandle, EngineError,
    InferenceEngine, Role,
};

#[cfg(feature = "llama")]
pub use edgechat_engine::LlamaEngine;
