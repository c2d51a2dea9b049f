//! Deterministic backends: recorded replay and a fixed mock.

use super::r#interface::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Recordings file contents.
///
/// ```json
/// { "recordings": { "<request key>": { "content": "...", "model": "..." } },
///   "default": { "content": "...", "model": "..." } }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recordings {
    /// Judgments keyed by [`RecordedBackend::key`]
    #[serde(default)]
    pub recordings: BTreeMap<String, Judgment>,

    /// Answer for requests with no recording
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Judgment>,
}

/// Replays judgments recorded earlier, keyed by a hash of the request.
#[derive(Debug, Clone)]
pub struct RecordedBackend {
    recordings: Recordings,
}

impl RecordedBackend {
    /// Use in-memory recordings.
    pub fn new(recordings: Recordings) -> Self {
        Self { recordings }
    }

    /// Load a recordings file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InferenceError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let recordings = serde_json::from_str(&text)
            .map_err(|e| InferenceError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        Ok(Self::new(recordings))
    }

    /// Stable key of a request: SHA-256 over aspect, prompt and content.
    pub fn key(request: &JudgmentRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.aspect.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.prompt.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.content.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

#[async_trait]
impl InferenceBackend for RecordedBackend {
    fn name(&self) -> &str {
        "recorded"
    }

    async fn judge(&self, request: &JudgmentRequest) -> Result<Judgment, InferenceError> {
        let key = Self::key(request);
        match self.recordings.recordings.get(&key) {
            Some(j) => Ok(j.clone()),
            None => {
                tracing::debug!("No recording for {}, using default", key);
                self.recordings
                    .default
                    .clone()
                    .ok_or(InferenceError::MissingRecording(key))
            }
        }
    }
}

/// Always answers with the same content.
#[derive(Debug, Clone)]
pub struct MockBackend {
    content: String,
    confidence: f64,
}

impl MockBackend {
    /// Create a mock.
    pub fn new(content: impl Into<String>, confidence: f64) -> Self {
        Self {
            content: content.into(),
            confidence,
        }
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn judge(&self, _request: &JudgmentRequest) -> Result<Judgment, InferenceError> {
        Ok(Judgment {
            content: self.content.clone(),
            model: "mock".to_string(),
            usage: Usage::default(),
            confidence: Some(self.confidence),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn judgment(content: &str) -> Judgment {
        Judgment {
            content: content.to_string(),
            model: "recorded-model".to_string(),
            usage: Usage::default(),
            confidence: Some(0.8),
        }
    }

    #[test]
    fn test_key_is_stable_and_distinct() {
        let a = JudgmentRequest::new("clarity", "p", "text");
        let b = JudgmentRequest::new("clarity", "p", "text!");
        assert_eq!(RecordedBackend::key(&a), RecordedBackend::key(&a.clone()));
        assert_ne!(RecordedBackend::key(&a), RecordedBackend::key(&b));
        assert_eq!(RecordedBackend::key(&a).len(), 64);
    }

    #[tokio::test]
    async fn test_replay_then_default_then_missing() {
        let req = JudgmentRequest::new("clarity", "p", "text");
        let other = JudgmentRequest::new("clarity", "p", "other");

        let mut recordings = Recordings::default();
        recordings
            .recordings
            .insert(RecordedBackend::key(&req), judgment("recorded"));
        let backend = RecordedBackend::new(recordings.clone());
        assert_eq!(backend.judge(&req).await.unwrap().content, "recorded");
        assert!(matches!(
            backend.judge(&other).await,
            Err(InferenceError::MissingRecording(_))
        ));

        recordings.default = Some(judgment("fallback"));
        let backend = RecordedBackend::new(recordings);
        assert_eq!(backend.judge(&other).await.unwrap().content, "fallback");
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rec.json");
        let recordings = Recordings {
            recordings: BTreeMap::new(),
            default: Some(judgment("from file")),
        };
        std::fs::write(&path, serde_json::to_string(&recordings).unwrap()).unwrap();

        let backend = RecordedBackend::load(&path).unwrap();
        let j = backend
            .judge(&JudgmentRequest::new("a", "b", "c"))
            .await
            .unwrap();
        assert_eq!(j.content, "from file");
    }
}
