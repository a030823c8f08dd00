use std::time::Duration;

use thiserror::Error;

/// Text produced by one generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    /// Model that answered, as reported by the service.
    pub model: Option<String>,
}

impl Generation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Failure of a generation call. Every variant fails the current job attempt.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("generation request timed out after {0:?}")]
    Timeout(Duration),

    #[error("generation service unreachable: {0}")]
    Transport(String),

    #[error("invalid generation response: {0}")]
    Decode(String),

    #[error("generation service returned an empty response")]
    EmptyResponse,
}
