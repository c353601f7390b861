//! Inference collaborator: turns text into a `(label, confidence)` pair.
//!
//! The model runtime lives outside this process. [`HttpInference`] talks to
//! it over a small JSON protocol:
//!
//! ```text
//! POST <endpoint>   {"text": "..."}
//! 200 OK            {"label": "promotions", "confidence": 0.87}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::InferenceError;

/// Raw model output before it is mapped to a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceLabel {
    pub label: String,
    pub confidence: f64,
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Classify free text. May fail or hang; callers bound it with a timeout.
    async fn classify_text(&self, text: &str) -> Result<InferenceLabel, InferenceError>;
}

/// HTTP client for an external inference service.
pub struct HttpInference {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpInference {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::RequestFailed(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl InferenceClient for HttpInference {
    async fn classify_text(&self, text: &str) -> Result<InferenceLabel, InferenceError> {
        let body = serde_json::json!({ "text": text });

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout(self.timeout)
                } else {
                    InferenceError::RequestFailed(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(InferenceError::RequestFailed(format!(
                "{} returned {status}",
                self.endpoint
            )));
        }

        let label: InferenceLabel = resp
            .json()
            .await
            .map_err(|e| InferenceError::InvalidResponse(e.to_string()))?;
        if !label.confidence.is_finite() || !(0.0..=1.0).contains(&label.confidence) {
            return Err(InferenceError::InvalidResponse(format!(
                "confidence {} outside [0, 1]",
                label.confidence
            )));
        }
        Ok(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_deserializes() {
        let label: InferenceLabel =
            serde_json::from_str(r#"{"label":"feed","confidence":0.72}"#).unwrap();
        assert_eq!(label.label, "feed");
        assert_eq!(label.confidence, 0.72);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_request_failure() {
        // Port 9 (discard) on localhost is essentially never served.
        let client = HttpInference::new("http://127.0.0.1:9/classify", Duration::from_secs(2))
            .unwrap();
        let err = client.classify_text("hello").await.unwrap_err();
        assert!(matches!(
            err,
            InferenceError::RequestFailed(_) | InferenceError::Timeout(_)
        ));
    }
}
