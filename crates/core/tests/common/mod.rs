#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use edgechat::models::registry::{ByteProgress, FetchRequest};
use edgechat::models::{Registry, RegistryError, RegistryFile};
use edgechat::{
    ChatMessage, Completion, CompletionRequest, ContextConfig, ContextHandle, EngineError,
    InferenceEngine, ModelSessionManager, SessionConfig,
};

pub const QWEN_REPO: &str = "medmekk/Qwen2.5-0.5B-Instruct.GGUF";
pub const QWEN_FAMILY: &str = "Qwen2-0.5B-Instruct";
pub const QWEN_FILE: &str = "qwen2-0.5b-q4.gguf";

/// Lets a test hold an async call until it says go.
#[derive(Default)]
pub struct Gate {
    enabled: AtomicBool,
    started: Notify,
    proceed: Notify,
}

impl Gate {
    pub fn hold(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Wait until a held call has started.
    pub async fn started(&self) {
        self.started.notified().await;
    }

    /// Let one held call continue.
    pub fn open(&self) {
        self.proceed.notify_one();
    }

    async fn pass(&self) {
        if self.enabled.load(Ordering::SeqCst) {
            self.started.notify_one();
            self.proceed.notified().await;
        }
    }
}

// ===== Registry =====

/// In-memory registry keyed by repository path and file name.
#[derive(Default)]
pub struct FakeRegistry {
    listings: Mutex<HashMap<String, Result<Vec<RegistryFile>, RegistryError>>>,
    contents: Mutex<HashMap<String, Vec<u8>>>,
    /// Transfers fail after writing this many bytes
    fail_after: Mutex<Option<usize>>,
    /// Transfers wait for cancellation instead of writing
    hang: AtomicBool,
    pub transfer_started: Notify,
    /// Holds transfers before any byte is written
    pub transfer_gate: Gate,
    transfers: AtomicUsize,
    resumes: Mutex<Vec<u64>>,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_listing(&self, repo: &str, files: Vec<RegistryFile>) {
        self.listings
            .lock()
            .unwrap()
            .insert(repo.to_string(), Ok(files));
    }

    pub fn with_listing_error(&self, repo: &str, error: RegistryError) {
        self.listings
            .lock()
            .unwrap()
            .insert(repo.to_string(), Err(error));
    }

    pub fn with_file(&self, repo: &str, file_name: &str, content: &[u8]) {
        self.contents
            .lock()
            .unwrap()
            .insert(self.download_url(repo, file_name), content.to_vec());
    }

    pub fn fail_after(&self, bytes: Option<usize>) {
        *self.fail_after.lock().unwrap() = bytes;
    }

    pub fn hang_transfers(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn stop_hanging(&self) {
        self.hang.store(false, Ordering::SeqCst);
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    /// `resume_from` of every transfer, in order
    pub fn resumes(&self) -> Vec<u64> {
        self.resumes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    fn download_url(&self, registry_path: &str, file_name: &str) -> String {
        format!("fake://{}/{}", registry_path, file_name)
    }

    async fn list_files(&self, registry_path: &str) -> Result<Vec<RegistryFile>, RegistryError> {
        self.listings
            .lock()
            .unwrap()
            .get(registry_path)
            .cloned()
            .unwrap_or_else(|| Err(RegistryError::Unavailable("404 Not Found".into())))
    }

    async fn fetch_file(
        &self,
        request: FetchRequest<'_>,
        on_bytes: ByteProgress<'_>,
    ) -> Result<(), RegistryError> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        self.resumes.lock().unwrap().push(request.resume_from);
        self.transfer_started.notify_one();
        self.transfer_gate.pass().await;

        if self.hang.load(Ordering::SeqCst) {
            tokio::fs::write(request.destination, b"partial").await.unwrap();
            request.cancel.cancelled().await;
            return Err(RegistryError::Cancelled);
        }

        let content = self
            .contents
            .lock()
            .unwrap()
            .get(request.url)
            .cloned()
            .ok_or_else(|| RegistryError::Transfer("404 Not Found".into()))?;
        let total = content.len() as u64;

        let mut written = if request.resume_from > 0 {
            std::fs::read(request.destination).unwrap()
        } else {
            Vec::new()
        };
        let remaining = &content[written.len()..];

        let fail_after = *self.fail_after.lock().unwrap();
        for chunk in remaining.chunks(4) {
            if fail_after.is_some_and(|limit| written.len() >= limit) {
                std::fs::write(request.destination, &written).unwrap();
                return Err(RegistryError::Transfer("Connection reset".into()));
            }
            written.extend_from_slice(chunk);
            on_bytes(written.len() as u64, Some(total));
        }

        std::fs::write(request.destination, &written).unwrap();
        Ok(())
    }
}

// ===== Engine =====

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Init(String),
    ReleaseAll,
    Completion(usize),
}

/// Engine that records every call and answers from a script.
#[derive(Default)]
pub struct FakeEngine {
    calls: Mutex<Vec<EngineCall>>,
    live: Mutex<HashSet<ContextHandle>>,
    max_live: AtomicUsize,
    replies: Mutex<VecDeque<Result<Option<String>, String>>>,
    fail_init: AtomicBool,
    pub init_gate: Gate,
    pub completion_gate: Gate,
    requests: Mutex<Vec<CompletionRequest>>,
    configs: Mutex<Vec<ContextConfig>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply_with(&self, reply: Result<Option<&str>, &str>) {
        self.replies.lock().unwrap().push_back(
            reply
                .map(|r| r.map(str::to_string))
                .map_err(str::to_string),
        );
    }

    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn live_contexts(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Most contexts ever alive at the same time
    pub fn max_live_contexts(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<ContextConfig> {
        self.configs.lock().unwrap().last().cloned()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl InferenceEngine for FakeEngine {
    async fn init_context(&self, config: ContextConfig) -> Result<ContextHandle, EngineError> {
        let name = config
            .model_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(EngineCall::Init(name));
        self.configs.lock().unwrap().push(config.clone());
        self.init_gate.pass().await;

        if self.fail_init.load(Ordering::SeqCst) {
            return Err(EngineError::ModelLoad("unsupported model format".into()));
        }

        let handle = ContextHandle::new(config.model_path);
        let mut live = self.live.lock().unwrap();
        live.insert(handle.clone());
        self.max_live.fetch_max(live.len(), Ordering::SeqCst);
        Ok(handle)
    }

    async fn release_all(&self) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(EngineCall::ReleaseAll);
        self.live.lock().unwrap().clear();
        Ok(())
    }

    async fn completion(
        &self,
        context: &ContextHandle,
        request: CompletionRequest,
    ) -> Result<Completion, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .push(EngineCall::Completion(request.messages.len()));
        self.requests.lock().unwrap().push(request);
        self.completion_gate.pass().await;

        if !self.live.lock().unwrap().contains(context) {
            return Err(EngineError::UnknownContext(context.id()));
        }

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Some("Hello! How can I help?".to_string())));
        match reply {
            Ok(text) => Ok(Completion { text }),
            Err(e) => Err(EngineError::Inference(e)),
        }
    }
}

// ===== Harness =====

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub registry: Arc<FakeRegistry>,
    pub engine: Arc<FakeEngine>,
    pub manager: Arc<ModelSessionManager>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::new();
        let engine = FakeEngine::new();
        let manager = ModelSessionManager::new(
            SessionConfig::with_storage_root(dir.path()),
            registry.clone(),
            engine.clone(),
        )
        .unwrap();
        Self {
            dir,
            registry,
            engine,
            manager: Arc::new(manager),
        }
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.path().join(file_name)
    }

    /// Put a complete artifact on disk without going through the registry.
    pub fn place_artifact(&self, file_name: &str) -> PathBuf {
        let path = self.path(file_name);
        std::fs::write(&path, b"GGUF weights").unwrap();
        path
    }

    pub fn initial_messages(&self) -> Vec<ChatMessage> {
        vec![ChatMessage::system(
            self.manager.config().system_prompt.clone(),
        )]
    }
}
