//! Inference collaborator.
//!
//! Validators that need a model's judgment talk to an [`InferenceBackend`].
//! The backend is chosen from configuration: a live HTTP service, a
//! recordings file for deterministic replay, or a fixed mock response.

#![warn(missing_docs)]

pub mod interface;
pub mod ollama;
pub mod recorded;
pub mod throttle;

pub use interface::{InferenceBackend, InferenceError, Judgment, JudgmentRequest, Usage};
pub use ollama::LiveBackend;
pub use recorded::{MockBackend, RecordedBackend, Recordings};
pub use throttle::ThrottledBackend;

use stagegate_core::{InferenceBackendKind, InferenceSettings};
use std::sync::Arc;

/// Build the backend described by `settings`, wrapped in a
/// [`ThrottledBackend`] that enforces `maxConcurrentRequests` and retries
/// transient errors.
pub fn from_settings(settings: &InferenceSettings) -> Result<Arc<dyn InferenceBackend>, InferenceError> {
    let inner: Arc<dyn InferenceBackend> = match settings.backend {
        InferenceBackendKind::Live => Arc::new(LiveBackend::from_settings(settings)?),
        InferenceBackendKind::Recorded => {
            let path = settings.recordings.as_ref().ok_or_else(|| {
                InferenceError::Config("inference.recordings is not set".to_string())
            })?;
            Arc::new(RecordedBackend::load(path)?)
        }
        InferenceBackendKind::Mock => Arc::new(MockBackend::new(
            settings.mock_content.clone(),
            settings.mock_confidence,
        )),
    };
    tracing::debug!("Inference backend: {}", inner.name());
    Ok(Arc::new(ThrottledBackend::from_settings(inner, settings)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_settings_give_mock() {
        let backend = from_settings(&InferenceSettings::default()).unwrap();
        let judgment = backend
            .judge(&JudgmentRequest::new("clarity", "Rate it.", "Some text."))
            .await
            .unwrap();
        assert_eq!(judgment.model, "mock");
        assert_eq!(judgment.confidence, Some(0.9));
    }

    #[test]
    fn test_recorded_requires_file() {
        let settings = InferenceSettings {
            backend: InferenceBackendKind::Recorded,
            ..Default::default()
        };
        assert!(matches!(from_settings(&settings), Err(InferenceError::Config(_))));
    }
}
