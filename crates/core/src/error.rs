use derive_more::From;

/// Failures surfaced by the session manager's operations.
///
/// Every variant leaves the owning state machine in a state where the same
/// action can be retried immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("No repository mapping found for model family: {0}")]
    UnknownFamily(String),
    #[error("Model registry unavailable: {0}")]
    RegistryUnavailable(String),
    #[error("Invalid registry response: {0}")]
    MalformedRegistryResponse(String),
    #[error("Download failed: {0}")]
    DownloadFailed(String),
    #[error("Model file {file_name} does not exist at {path}")]
    ModelFileMissing { file_name: String, path: String },
    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),
    #[error("Another model is currently loading")]
    LoadInProgress,
    #[error("No model loaded")]
    NoActiveModel,
    #[error("Message is empty")]
    EmptyInput,
    #[error("A response is already being generated")]
    GenerationInProgress,
    #[error("No response from the model")]
    NoCompletionProduced,
    #[error("Inference failed: {0}")]
    InferenceFailed(String),
    #[error("Session was reset before the response arrived")]
    SessionReset,
}

impl SessionError {
    /// Heading for the single notification shown to the user.
    pub fn title(&self) -> &'static str {
        match self {
            SessionError::ModelFileMissing { .. }
            | SessionError::ModelLoadFailed(_)
            | SessionError::LoadInProgress => "Error Loading Model",
            SessionError::NoActiveModel => "Model Not Loaded",
            SessionError::EmptyInput => "Input Error",
            SessionError::GenerationInProgress
            | SessionError::NoCompletionProduced
            | SessionError::InferenceFailed(_)
            | SessionError::SessionReset => "Error During Inference",
            SessionError::UnknownFamily(_)
            | SessionError::RegistryUnavailable(_)
            | SessionError::MalformedRegistryResponse(_)
            | SessionError::DownloadFailed(_) => "Error",
        }
    }

    /// Returns a user-friendly error message suitable for display in the UI
    pub fn user_message(&self) -> String {
        match self {
            SessionError::UnknownFamily(family) => {
                format!("No repository mapping found for model format: {}", family)
            }
            SessionError::RegistryUnavailable(_) => {
                "Failed to fetch .gguf files. Check your connection and try again.".to_string()
            }
            SessionError::MalformedRegistryResponse(_) => "Invalid API response format".to_string(),
            SessionError::DownloadFailed(reason) => format!("Download failed: {}", reason),
            SessionError::ModelFileMissing { file_name, path } => {
                format!("The model file {} does not exist at {}.", file_name, path)
            }
            SessionError::ModelLoadFailed(detail) => detail.clone(),
            SessionError::LoadInProgress => {
                "Another model is still loading. Please wait.".to_string()
            }
            SessionError::NoActiveModel => "Please load a model first.".to_string(),
            SessionError::EmptyInput => "Please enter a message.".to_string(),
            SessionError::GenerationInProgress => {
                "Please wait for the current response to finish.".to_string()
            }
            SessionError::NoCompletionProduced => "No response from the model.".to_string(),
            SessionError::InferenceFailed(detail) => detail.clone(),
            SessionError::SessionReset => {
                "The model was changed before the response arrived.".to_string()
            }
        }
    }
}

/// Crate-level error for callers that mix configuration and session work.
#[derive(Debug, From, derive_more::Display)]
pub enum Error {
    #[from]
    Session(SessionError),

    #[from]
    Config(crate::config::ConfigError),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Session(e) => Some(e),
            Error::Config(e) => Some(e),
        }
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
