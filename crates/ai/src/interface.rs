//! Inference backend interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A request for a judgment on some content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentRequest {
    /// What is being judged (e.g. `clarity`, `factual-accuracy`)
    pub aspect: String,

    /// Instructions
    pub prompt: String,

    /// Content under judgment
    pub content: String,
}

impl JudgmentRequest {
    /// Create a request.
    pub fn new(
        aspect: impl Into<String>,
        prompt: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            aspect: aspect.into(),
            prompt: prompt.into(),
            content: content.into(),
        }
    }

    /// Full prompt text sent to a model.
    pub fn render(&self) -> String {
        format!(
            "{}\n\nAspect: {}\n\nRespond with JSON: {{\"score\": 0-100, \"confidence\": 0-1, \"findings\": [{{\"severity\": \"critical|high|medium|low|info\", \"message\": \"...\", \"remediation\": \"...\"}}]}}\n\n---\n{}",
            self.prompt, self.aspect, self.content
        )
    }
}

/// Token and cost accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    #[serde(default)]
    pub prompt_tokens: u64,

    /// Completion tokens
    #[serde(default)]
    pub completion_tokens: u64,

    /// Cost in configured currency units
    #[serde(default)]
    pub cost: f64,
}

/// A model's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    /// Response text
    pub content: String,

    /// Model that answered
    pub model: String,

    /// Usage
    #[serde(default)]
    pub usage: Usage,

    /// Confidence in [0,1], when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Inference errors.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    /// The service could not be reached
    #[error("inference service unreachable: {0}")]
    Unreachable(String),

    /// The request did not finish in time
    #[error("inference request timed out")]
    Timeout,

    /// The service answered with an error status
    #[error("inference service returned {status}: {body}")]
    Status {
        /// HTTP status
        status: u16,
        /// Response body
        body: String,
    },

    /// The answer could not be understood
    #[error("malformed inference response: {0}")]
    Malformed(String),

    /// No recording matches the request
    #[error("no recording for request {0}")]
    MissingRecording(String),

    /// Recordings file problem
    #[error("failed to read recordings: {0}")]
    Io(#[from] std::io::Error),

    /// Backend misconfigured
    #[error("inference configuration error: {0}")]
    Config(String),
}

impl InferenceError {
    /// Whether retrying may help.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::Unreachable(_) | InferenceError::Timeout => true,
            InferenceError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Something that can answer judgment requests.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Ask for a judgment.
    async fn judge(&self, request: &JudgmentRequest) -> Result<Judgment, InferenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(InferenceError::Timeout.is_transient());
        assert!(InferenceError::Status {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!InferenceError::Status {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!InferenceError::MissingRecording("k".into()).is_transient());
    }

    #[test]
    fn test_render_contains_content() {
        let req = JudgmentRequest::new("clarity", "Judge this.", "The text.");
        let prompt = req.render();
        assert!(prompt.starts_with("Judge this."));
        assert!(prompt.ends_with("The text."));
    }
}
