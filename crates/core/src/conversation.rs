//! Conversation engine: the message log and the single in-flight generation.
//!
//! The user's turn is appended before the engine is called so it renders
//! immediately. It is kept even if inference fails, so typed input is never
//! lost; a conversation may therefore end on a user turn.
//!
//! Every reset bumps an epoch. A completion that returns after a reset
//! belongs to a conversation that no longer exists and is discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use edgechat_engine::{ChatMessage, Completion, CompletionRequest, ContextHandle, InferenceEngine};

use crate::config::GenerationSettings;
use crate::error::SessionError;
use crate::events::{EventBus, GenerationStateChanged};

/// Snapshot of the conversation for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub messages: Vec<ChatMessage>,
    pub is_generating: bool,
}

struct Inner {
    messages: Vec<ChatMessage>,
    is_generating: bool,
    epoch: u64,
}

pub struct Conversation {
    engine: Arc<dyn InferenceEngine>,
    settings: GenerationSettings,
    system_prompt: String,
    events: EventBus,
    inner: Mutex<Inner>,
}

/// Clears the in-flight flag when the generation ends, however it ends.
struct InFlight<'a> {
    conversation: &'a Conversation,
    epoch: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut inner = self.conversation.lock();
        // A reset already cleared the flag; a newer generation may own it now.
        if inner.epoch == self.epoch {
            inner.is_generating = false;
        }
    }
}

impl Conversation {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        settings: GenerationSettings,
        system_prompt: impl Into<String>,
        events: EventBus,
    ) -> Self {
        let system_prompt = system_prompt.into();
        Self {
            engine,
            settings,
            inner: Mutex::new(Inner {
                messages: vec![ChatMessage::system(system_prompt.clone())],
                is_generating: false,
                epoch: 0,
            }),
            system_prompt,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The single-element sequence every conversation starts from.
    pub fn initial_messages(&self) -> Vec<ChatMessage> {
        vec![ChatMessage::system(self.system_prompt.clone())]
    }

    pub fn state(&self) -> ConversationState {
        let inner = self.lock();
        ConversationState {
            messages: inner.messages.clone(),
            is_generating: inner.is_generating,
        }
    }

    /// Back to the system preamble. Any in-flight result will be discarded.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.messages = self.initial_messages();
        inner.is_generating = false;
        inner.epoch += 1;
        debug!("Conversation reset (epoch {})", inner.epoch);
    }

    /// Append `text` as a user turn and ask the engine for the assistant's reply.
    pub async fn send_message(
        &self,
        context: Option<&ContextHandle>,
        text: &str,
    ) -> Result<String, SessionError> {
        let context = context.ok_or(SessionError::NoActiveModel)?;
        if text.trim().is_empty() {
            return Err(SessionError::EmptyInput);
        }

        let (messages, epoch) = {
            let mut inner = self.lock();
            if inner.is_generating {
                warn!("Rejected message: a response is already being generated");
                return Err(SessionError::GenerationInProgress);
            }
            inner.messages.push(ChatMessage::user(text));
            inner.is_generating = true;
            (inner.messages.clone(), inner.epoch)
        };
        let _in_flight = InFlight {
            conversation: self,
            epoch,
        };

        self.events.emit(GenerationStateChanged::Started);
        info!("Generating reply ({} messages in context)", messages.len());

        let request = CompletionRequest {
            messages,
            n_predict: self.settings.max_tokens,
            stop: self.settings.stop_markers.clone(),
        };
        let result = self.engine.completion(context, request).await;

        let outcome = {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                warn!("Discarding reply for a conversation that was reset");
                Err(SessionError::SessionReset)
            } else {
                match result {
                    Ok(Completion { text: Some(text) }) if !text.trim().is_empty() => {
                        let reply = text.trim().to_string();
                        inner.messages.push(ChatMessage::assistant(reply.clone()));
                        inner.is_generating = false;
                        Ok(reply)
                    }
                    Ok(_) => Err(SessionError::NoCompletionProduced),
                    Err(e) => Err(SessionError::InferenceFailed(e.to_string())),
                }
            }
        };

        match &outcome {
            Ok(reply) => {
                debug!("Reply complete: {} characters", reply.len());
                self.events.emit(GenerationStateChanged::Complete {
                    text: reply.clone(),
                });
            }
            Err(e) => {
                error!("Generation failed: {}", e);
                self.events.emit(GenerationStateChanged::Error {
                    error: e.to_string(),
                });
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use edgechat_engine::{ContextConfig, EngineError, Role};

    /// Engine that answers every completion with a fixed result.
    struct CannedEngine {
        reply: Result<Option<String>, String>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl CannedEngine {
        fn replying(reply: Result<Option<&str>, &str>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(|r| r.map(str::to_string)).map_err(str::to_string),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl InferenceEngine for CannedEngine {
        async fn init_context(&self, config: ContextConfig) -> Result<ContextHandle, EngineError> {
            Ok(ContextHandle::new(config.model_path))
        }

        async fn release_all(&self) -> Result<(), EngineError> {
            Ok(())
        }

        async fn completion(
            &self,
            _context: &ContextHandle,
            request: CompletionRequest,
        ) -> Result<Completion, EngineError> {
            self.requests.lock().unwrap().push(request);
            match &self.reply {
                Ok(text) => Ok(Completion { text: text.clone() }),
                Err(e) => Err(EngineError::Inference(e.clone())),
            }
        }
    }

    fn conversation(engine: Arc<CannedEngine>) -> Conversation {
        Conversation::new(
            engine,
            GenerationSettings::default(),
            "You are terse.",
            EventBus::new(),
        )
    }

    fn handle() -> ContextHandle {
        ContextHandle::new("/models/a.gguf")
    }

    #[tokio::test]
    async fn successful_turn_appends_user_and_trimmed_reply() {
        let engine = CannedEngine::replying(Ok(Some("  Hi there!\n")));
        let conversation = conversation(engine.clone());

        let reply = conversation.send_message(Some(&handle()), "Hello").await;
        assert_eq!(reply, Ok("Hi there!".to_string()));

        let state = conversation.state();
        assert!(!state.is_generating);
        assert_eq!(
            state.messages,
            vec![
                ChatMessage::system("You are terse."),
                ChatMessage::user("Hello"),
                ChatMessage::assistant("Hi there!"),
            ]
        );

        let requests = engine.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages.len(), 2);
        assert_eq!(requests[0].messages[1].role, Role::User);
        assert_eq!(requests[0].n_predict, 10_000);
        assert!(requests[0].stop.contains(&"<|eot_id|>".to_string()));
    }

    #[tokio::test]
    async fn empty_input_is_rejected_without_side_effects() {
        let engine = CannedEngine::replying(Ok(Some("unused")));
        let conversation = conversation(engine.clone());

        for text in ["", "   ", "\n\t"] {
            assert_eq!(
                conversation.send_message(Some(&handle()), text).await,
                Err(SessionError::EmptyInput)
            );
        }
        assert_eq!(conversation.state().messages.len(), 1);
        assert!(engine.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_context_is_rejected() {
        let conversation = conversation(CannedEngine::replying(Ok(Some("unused"))));
        assert_eq!(
            conversation.send_message(None, "Hello").await,
            Err(SessionError::NoActiveModel)
        );
        assert_eq!(conversation.state().messages.len(), 1);
    }

    #[tokio::test]
    async fn blank_reply_is_no_completion() {
        for reply in [None, Some(""), Some("  \n ")] {
            let conversation = conversation(CannedEngine::replying(Ok(reply)));
            assert_eq!(
                conversation.send_message(Some(&handle()), "Hello").await,
                Err(SessionError::NoCompletionProduced)
            );
            let state = conversation.state();
            assert_eq!(state.messages.len(), 2);
            assert!(!state.is_generating);
        }
    }

    #[tokio::test]
    async fn engine_failure_keeps_user_turn() {
        let conversation = conversation(CannedEngine::replying(Err("kv cache full")));

        let result = conversation.send_message(Some(&handle()), "Hello").await;
        assert_eq!(
            result,
            Err(SessionError::InferenceFailed(
                "Inference failed: kv cache full".into()
            ))
        );

        let state = conversation.state();
        assert_eq!(state.messages.last(), Some(&ChatMessage::user("Hello")));
        assert_eq!(state.messages.len(), 2);
        assert!(!state.is_generating);
    }

    #[tokio::test]
    async fn reset_restores_system_preamble() {
        let conversation = conversation(CannedEngine::replying(Ok(Some("Hi"))));
        conversation
            .send_message(Some(&handle()), "Hello")
            .await
            .unwrap();
        assert_eq!(conversation.state().messages.len(), 3);

        conversation.reset();
        assert_eq!(conversation.state().messages, conversation.initial_messages());
    }
}
