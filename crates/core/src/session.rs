//! Session lifecycle: owns the single active inference context.
//!
//! The engine can only release *every* context at once, so at most one may
//! exist. The lifecycle enforces that by holding the context as an exclusive
//! [`ContextLease`] and serializing load and release behind one gate.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use edgechat_engine::{ContextHandle, InferenceEngine};

use crate::config::EngineSettings;
use crate::conversation::Conversation;
use crate::error::SessionError;
use crate::events::{EventBus, ModelLoadingStateChanged};
use crate::models::ArtifactStore;

/// Ownership of the active context. Not `Clone`.
#[derive(Debug)]
struct ContextLease {
    handle: ContextHandle,
    file_name: String,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SessionPhase {
    #[default]
    NoContext,
    Loading,
    Ready,
}

/// Snapshot of the lifecycle for the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub phase: SessionPhase,
    pub context: Option<ContextHandle>,
    pub model_file_name: Option<String>,
    pub is_loading: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pending {
    Load(String),
    Release,
}

struct Inner {
    lease: Option<ContextLease>,
    pending: Option<Pending>,
    /// Engine work was abandoned mid-flight; a context may be alive without a lease
    orphaned: bool,
    /// Bumped by `force_release`; a load started before it must not install its context
    teardowns: u64,
}

pub struct SessionLifecycle {
    engine: Arc<dyn InferenceEngine>,
    store: ArtifactStore,
    settings: EngineSettings,
    conversation: Arc<Conversation>,
    events: EventBus,
    inner: Mutex<Inner>,
}

/// Clears the pending gate on every exit path.
///
/// While `armed`, engine calls are outstanding; dropping the guard then means
/// the caller's future was cancelled and the engine state is unknown.
struct PendingGuard<'a> {
    session: &'a SessionLifecycle,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.session.lock();
        inner.pending = None;
        if self.armed {
            warn!("Model operation abandoned mid-flight, next load will release all contexts");
            inner.orphaned = true;
        }
    }
}

impl SessionLifecycle {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        store: ArtifactStore,
        settings: EngineSettings,
        conversation: Arc<Conversation>,
        events: EventBus,
    ) -> Self {
        Self {
            engine,
            store,
            settings,
            conversation,
            events,
            inner: Mutex::new(Inner {
                lease: None,
                pending: None,
                orphaned: false,
                teardowns: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        let inner = self.lock();
        let is_loading = matches!(inner.pending, Some(Pending::Load(_)));
        let phase = if is_loading {
            SessionPhase::Loading
        } else if inner.lease.is_some() {
            SessionPhase::Ready
        } else {
            SessionPhase::NoContext
        };
        SessionState {
            phase,
            context: inner.lease.as_ref().map(|l| l.handle.clone()),
            model_file_name: inner.lease.as_ref().map(|l| l.file_name.clone()),
            is_loading,
        }
    }

    pub fn active_context(&self) -> Option<ContextHandle> {
        self.lock().lease.as_ref().map(|l| l.handle.clone())
    }

    pub fn loaded_file_name(&self) -> Option<String> {
        self.lock().lease.as_ref().map(|l| l.file_name.clone())
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.lock().pending, Some(Pending::Load(_)))
    }

    /// Load `file_name` from the artifact store into a fresh context.
    ///
    /// This is an async operation that:
    /// 1. Emits `started`
    /// 2. Checks the file is on disk (the active context survives if not)
    /// 3. Releases the active context and resets the conversation
    /// 4. Constructs the new context
    /// 5. Emits `complete` or `error`
    pub async fn load_model(&self, file_name: &str) -> Result<ContextHandle, SessionError> {
        let teardowns = {
            let mut inner = self.lock();
            if let Some(pending) = &inner.pending {
                warn!(
                    "Rejected load of '{}' while {:?} is pending",
                    file_name, pending
                );
                return Err(SessionError::LoadInProgress);
            }
            inner.pending = Some(Pending::Load(file_name.to_string()));
            inner.teardowns
        };
        let mut guard = PendingGuard {
            session: self,
            armed: false,
        };

        self.events.emit(ModelLoadingStateChanged::Started {
            file_name: file_name.to_string(),
        });
        debug!(">>> LOAD START: '{}'", file_name);
        info!("Loading model '{}'", file_name);

        let Some(model_path) = self.store.existing_path(file_name) else {
            let err = SessionError::ModelFileMissing {
                file_name: file_name.to_string(),
                path: self.store.display_path(file_name),
            };
            error!("{}", err);
            self.emit_load_error(file_name, &err);
            return Err(err);
        };
        debug!("Model path resolved: {:?}", model_path);

        guard.armed = true;
        let (previous, orphaned) = {
            let mut inner = self.lock();
            (inner.lease.take(), inner.orphaned)
        };

        if previous.is_some() || orphaned {
            self.conversation.reset();
            if let Err(e) = self.engine.release_all().await {
                guard.armed = false;
                // The old context may still be alive; retry the release next time.
                self.lock().orphaned = true;
                let err = SessionError::ModelLoadFailed(format!(
                    "Failed to release the previous model: {}",
                    e
                ));
                error!("{}", err);
                self.emit_load_error(file_name, &err);
                return Err(err);
            }
            self.lock().orphaned = false;
            if let Some(previous) = previous {
                info!("Released model '{}'", previous.file_name);
                self.events.emit(ModelLoadingStateChanged::Released {
                    file_name: previous.file_name,
                });
            }
        }

        let config = self.settings.context_config(model_path);
        let result = self.engine.init_context(config).await;
        guard.armed = false;

        match result {
            Ok(handle) => {
                self.conversation.reset();
                let torn_down = {
                    let mut inner = self.lock();
                    let torn_down = inner.teardowns != teardowns;
                    if !torn_down {
                        inner.lease = Some(ContextLease {
                            handle: handle.clone(),
                            file_name: file_name.to_string(),
                        });
                    }
                    torn_down
                };
                if torn_down {
                    warn!("Session torn down while loading '{}', releasing it", file_name);
                    guard.armed = true;
                    let released = self.engine.release_all().await;
                    guard.armed = false;
                    if let Err(e) = released {
                        warn!("Engine failed to release contexts: {}", e);
                        self.lock().orphaned = true;
                    }
                    let err = SessionError::ModelLoadFailed(
                        "Session was shut down during load".to_string(),
                    );
                    self.emit_load_error(file_name, &err);
                    return Err(err);
                }
                debug!("<<< LOAD COMPLETE: '{}' is ready", file_name);
                info!("Model '{}' loaded successfully", file_name);
                self.events.emit(ModelLoadingStateChanged::Complete {
                    file_name: file_name.to_string(),
                });
                Ok(handle)
            }
            Err(e) => {
                let err = SessionError::ModelLoadFailed(e.to_string());
                error!("{}", err);
                self.emit_load_error(file_name, &err);
                Err(err)
            }
        }
    }

    /// Release the active context. No-op when nothing is loaded.
    ///
    /// Best-effort: an engine failure is logged and the lease is dropped anyway.
    pub async fn release_model(&self) -> Result<(), SessionError> {
        let lease = {
            let mut inner = self.lock();
            match &inner.pending {
                Some(Pending::Load(_)) => return Err(SessionError::LoadInProgress),
                Some(Pending::Release) => {
                    debug!("Release already in progress");
                    return Ok(());
                }
                None => {}
            }
            if inner.lease.is_none() && !inner.orphaned {
                debug!("No model loaded, nothing to release");
                return Ok(());
            }
            inner.pending = Some(Pending::Release);
            inner.lease.take()
        };
        let mut guard = PendingGuard {
            session: self,
            armed: true,
        };

        self.release(lease).await;
        guard.armed = false;
        Ok(())
    }

    /// Release for teardown, ignoring the pending gate.
    ///
    /// A load still in flight discards its context when it completes.
    pub async fn force_release(&self) {
        let lease = {
            let mut inner = self.lock();
            inner.teardowns += 1;
            inner.lease.take()
        };
        self.release(lease).await;
    }

    async fn release(&self, lease: Option<ContextLease>) {
        // Late completions against the old context are discarded.
        self.conversation.reset();

        match self.engine.release_all().await {
            Ok(()) => debug!("Engine released all contexts"),
            Err(e) => warn!("Engine failed to release contexts: {}", e),
        }
        self.lock().orphaned = false;

        if let Some(lease) = lease {
            info!("Released model '{}'", lease.file_name);
            self.events.emit(ModelLoadingStateChanged::Released {
                file_name: lease.file_name,
            });
        }
    }

    fn emit_load_error(&self, file_name: &str, err: &SessionError) {
        self.events.emit(ModelLoadingStateChanged::Error {
            file_name: file_name.to_string(),
            error: err.user_message(),
        });
    }
}
