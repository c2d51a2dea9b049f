//! Live HTTP backend (Ollama-compatible `/api/generate`).

use super::r#interface::*;
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde_json::json;
use stagegate_core::InferenceSettings;
use tracing::{debug, warn};

/// Live inference client.
#[derive(Clone)]
pub struct LiveBackend {
    /// HTTP client
    client: Client,

    /// Server URL
    url: String,

    /// Model name
    model: String,

    /// Cost per 1000 tokens
    cost_per_1k: f64,
}

impl LiveBackend {
    /// Create a client for `url` and `model`.
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, InferenceError> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Config(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            cost_per_1k: 0.0,
        })
    }

    /// Create a client from configuration.
    pub fn from_settings(settings: &InferenceSettings) -> Result<Self, InferenceError> {
        let mut backend = Self::new(
            settings.endpoint.clone(),
            settings.model.clone(),
            std::time::Duration::from_secs(settings.timeout_secs),
        )?;
        backend.cost_per_1k = settings.cost_per_1k_tokens;
        Ok(backend)
    }
}

#[derive(serde::Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

/// Pull a `confidence` field out of a JSON answer, if there is one.
pub(crate) fn confidence_of(content: &str) -> Option<f64> {
    serde_json::from_str::<serde_json::Value>(content)
        .ok()?
        .get("confidence")?
        .as_f64()
        .map(|c| c.clamp(0.0, 1.0))
}

#[async_trait]
impl InferenceBackend for LiveBackend {
    fn name(&self) -> &str {
        "live"
    }

    async fn judge(&self, request: &JudgmentRequest) -> Result<Judgment, InferenceError> {
        let payload = json!({
            "model": self.model,
            "prompt": request.render(),
            "stream": false,
            "format": "json",
        });

        debug!("Requesting judgment on '{}' from {}", request.aspect, self.url);

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout
                } else {
                    InferenceError::Unreachable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!("Inference API error (status {}): {}", status, body);
            return Err(InferenceError::Status { status, body });
        }

        let data: GenerateResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;

        let tokens = data.prompt_eval_count + data.eval_count;
        Ok(Judgment {
            confidence: confidence_of(&data.response),
            model: data.model.unwrap_or_else(|| self.model.clone()),
            usage: Usage {
                prompt_tokens: data.prompt_eval_count,
                completion_tokens: data.eval_count,
                cost: tokens as f64 / 1000.0 * self.cost_per_1k,
            },
            content: data.response,
        })
    }
}
