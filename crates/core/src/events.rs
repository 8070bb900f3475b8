//! Typesafe events emitted by the session manager.
//!
//! The UI subscribes through [`EventBus::subscribe`] and reacts to state
//! transitions instead of polling. Uses discriminated unions (tagged enums)
//! so the serialized form is easy to match on.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Model download state change event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DownloadStateChanged {
    /// Download is in progress
    #[serde(rename = "progress")]
    Progress {
        #[serde(rename = "fileName")]
        file_name: String,
        progress: f64,
    },
    /// Download complete, verifying checksum
    #[serde(rename = "verifying")]
    Verifying {
        #[serde(rename = "fileName")]
        file_name: String,
    },
    /// File is on disk (downloaded now or already present)
    #[serde(rename = "complete")]
    Complete {
        #[serde(rename = "fileName")]
        file_name: String,
        path: String,
    },
    /// Download failed with an error
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "fileName")]
        file_name: String,
        error: String,
    },
}

/// Model loading state change event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ModelLoadingStateChanged {
    #[serde(rename = "started")]
    Started {
        #[serde(rename = "fileName")]
        file_name: String,
    },
    #[serde(rename = "complete")]
    Complete {
        #[serde(rename = "fileName")]
        file_name: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "fileName")]
        file_name: String,
        error: String,
    },
    /// Context released, no model loaded
    #[serde(rename = "released")]
    Released {
        #[serde(rename = "fileName")]
        file_name: String,
    },
}

/// Chat completion state change event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum GenerationStateChanged {
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "complete")]
    Complete { text: String },
    #[serde(rename = "error")]
    Error { error: String },
}

/// Every event the manager emits, on a single stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    Download(DownloadStateChanged),
    Loading(ModelLoadingStateChanged),
    Generation(GenerationStateChanged),
}

impl From<DownloadStateChanged> for SessionEvent {
    fn from(event: DownloadStateChanged) -> Self {
        SessionEvent::Download(event)
    }
}

impl From<ModelLoadingStateChanged> for SessionEvent {
    fn from(event: ModelLoadingStateChanged) -> Self {
        SessionEvent::Loading(event)
    }
}

impl From<GenerationStateChanged> for SessionEvent {
    fn from(event: GenerationStateChanged) -> Self {
        SessionEvent::Generation(event)
    }
}

/// Broadcast channel shared by all components.
///
/// Emitting with no subscribers is not an error; the event is dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: impl Into<SessionEvent>) {
        let _ = self.tx.send(event.into());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_as_tagged_unions() {
        let event = SessionEvent::from(DownloadStateChanged::Progress {
            file_name: "a.gguf".into(),
            progress: 0.5,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "download",
                "event": {"state": "progress", "fileName": "a.gguf", "progress": 0.5}
            })
        );
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(GenerationStateChanged::Started);
        bus.emit(ModelLoadingStateChanged::Complete {
            file_name: "a.gguf".into(),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::Generation(GenerationStateChanged::Started)
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::Loading(ModelLoadingStateChanged::Complete { .. })
        ));
    }

    #[test]
    fn emitting_without_subscribers_is_silent() {
        EventBus::new().emit(GenerationStateChanged::Error {
            error: "boom".into(),
        });
    }
}
