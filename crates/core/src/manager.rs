use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::broadcast;

use edgechat_engine::{ContextHandle, InferenceEngine};

use crate::config::{
    default_settings_path, load_session_config, ConfigError, ConfigStore, JsonFileStore,
    SessionConfig,
};
use crate::conversation::{Conversation, ConversationState};
use crate::error::{Error, SessionError};
use crate::events::{EventBus, SessionEvent};
use crate::models::{
    self, ArtifactStatus, ArtifactStore, DownloadPipeline, DownloadState, HuggingFaceRegistry,
    Registry,
};
use crate::session::{SessionLifecycle, SessionState};

/// Facade over the download pipeline, the session lifecycle and the
/// conversation. One instance per process; share it behind an `Arc`.
pub struct ModelSessionManager {
    config: SessionConfig,
    events: EventBus,
    pipeline: DownloadPipeline,
    session: SessionLifecycle,
    conversation: Arc<Conversation>,
}

impl ModelSessionManager {
    /// Build a manager, creating the storage root if needed.
    pub fn new(
        config: SessionConfig,
        registry: Arc<dyn Registry>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(&config.storage_root).map_err(ConfigError::from)?;
        info!("Artifact storage at {:?}", config.storage_root);

        let events = EventBus::new();
        let store = ArtifactStore::new(config.storage_root.clone());
        let conversation = Arc::new(Conversation::new(
            engine.clone(),
            config.generation.clone(),
            config.system_prompt.clone(),
            events.clone(),
        ));
        let session = SessionLifecycle::new(
            engine,
            store.clone(),
            config.engine.clone(),
            conversation.clone(),
            events.clone(),
        );
        let pipeline = DownloadPipeline::new(registry, store, events.clone());

        Ok(Self {
            config,
            events,
            pipeline,
            session,
            conversation,
        })
    }

    /// Manager backed by the Hugging Face registry described in `config`.
    pub fn with_huggingface(
        config: SessionConfig,
        engine: Arc<dyn InferenceEngine>,
    ) -> Result<Self, Error> {
        let registry = HuggingFaceRegistry::new(&config.registry)
            .map_err(|e| SessionError::RegistryUnavailable(e.to_string()))?;
        Self::new(config, Arc::new(registry), engine)
    }

    /// Manager configured from the session config persisted in `store`.
    pub fn from_store(
        store: &impl ConfigStore,
        engine: Arc<dyn InferenceEngine>,
    ) -> Result<Self, Error> {
        Self::with_huggingface(load_session_config(store), engine)
    }

    /// Manager configured from the settings file in the user's config directory.
    pub fn with_default_settings(engine: Arc<dyn InferenceEngine>) -> Result<Self, Error> {
        let path = default_settings_path();
        debug!("Reading settings from {:?}", path);
        let store = JsonFileStore::open(path)?;
        Self::from_store(&store, engine)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    // ===== Artifacts =====

    pub fn list_families(&self) -> Vec<&'static str> {
        models::list_families()
    }

    pub async fn list_artifacts(&self, family_id: &str) -> Result<Vec<String>, SessionError> {
        self.pipeline.list_artifacts(family_id).await
    }

    pub async fn download_artifact<F>(
        &self,
        family_id: &str,
        file_name: &str,
        on_progress: F,
    ) -> Result<PathBuf, SessionError>
    where
        F: Fn(f64) + Send + Sync,
    {
        self.pipeline
            .download_artifact(family_id, file_name, on_progress)
            .await
    }

    pub fn cancel_download(&self, file_name: &str) -> bool {
        self.pipeline.cancel_download(file_name)
    }

    pub fn download_state(&self) -> DownloadState {
        self.pipeline.state()
    }

    pub fn artifact_status(&self, file_name: &str) -> ArtifactStatus {
        let loaded = self.session.loaded_file_name();
        self.pipeline.artifact_status(file_name, loaded.as_deref())
    }

    /// Local path of a fully downloaded artifact.
    pub fn local_path(&self, file_name: &str) -> Option<PathBuf> {
        self.pipeline.local_path(file_name)
    }

    pub fn is_downloaded(&self, file_name: &str) -> bool {
        self.pipeline.is_downloaded(file_name)
    }

    /// Artifacts fully present under the storage root.
    pub fn list_downloaded(&self) -> Vec<String> {
        self.pipeline.store().list_downloaded()
    }

    // ===== Session =====

    pub async fn load_model(&self, file_name: &str) -> Result<ContextHandle, SessionError> {
        self.session.load_model(file_name).await
    }

    pub async fn release_model(&self) -> Result<(), SessionError> {
        self.session.release_model().await
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    // ===== Conversation =====

    pub async fn send_message(&self, text: &str) -> Result<String, SessionError> {
        let context = self.session.active_context();
        self.conversation.send_message(context.as_ref(), text).await
    }

    pub fn conversation_state(&self) -> ConversationState {
        self.conversation.state()
    }

    /// Cancel downloads and release the engine before the process exits.
    pub async fn shutdown(&self) {
        debug!("Shutting down session manager");
        self.pipeline.cancel_all();
        self.session.force_release().await;
    }
}
