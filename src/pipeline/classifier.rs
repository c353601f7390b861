//! Category classification strategies behind one trait.
//!
//! - [`RuleClassifier`] scores keywords and sender domains locally.
//! - [`ModelClassifier`] asks the inference collaborator and drops back to the
//!   rules (tagged `rule_based_fallback`) whenever the model errors, times
//!   out, returns an unknown label or is less confident than the agent's
//!   threshold.
//!
//! Neither strategy fails: every message gets a category.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::ClassificationSection;
use crate::inference::InferenceClient;
use crate::pipeline::rules::RuleClassifier;
use crate::pipeline::types::{Category, Classification, ClassificationMethod, ParsedEmail};

/// Longest body slice sent to the model, in characters.
pub const MODEL_BODY_CHARS: usize = 1000;

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, email: &ParsedEmail) -> Classification;

    /// Whether classification needs the inference token.
    fn uses_inference(&self) -> bool {
        false
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    async fn classify(&self, email: &ParsedEmail) -> Classification {
        RuleClassifier::classify(self, email)
    }
}

/// Model-backed classifier with rule-based fallback.
pub struct ModelClassifier {
    client: Arc<dyn InferenceClient>,
    rules: RuleClassifier,
    timeout: Duration,
    confidence_threshold: f64,
}

impl ModelClassifier {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        timeout: Duration,
        confidence_threshold: f64,
    ) -> Self {
        Self {
            client,
            rules: RuleClassifier::default_rules(),
            timeout,
            confidence_threshold,
        }
    }

    fn fallback(&self, email: &ParsedEmail, why: &str) -> Classification {
        let mut classification = self.rules.classify(email);
        classification.method = ClassificationMethod::RuleBasedFallback;
        debug!(
            hash = %email.hash,
            why,
            category = %classification.category,
            "Model unusable, used rules"
        );
        classification
    }
}

#[async_trait]
impl Classifier for ModelClassifier {
    async fn classify(&self, email: &ParsedEmail) -> Classification {
        let input = model_input(email);
        let result = tokio::time::timeout(self.timeout, self.client.classify_text(&input)).await;

        let label = match result {
            Ok(Ok(label)) => label,
            Ok(Err(e)) => {
                warn!(hash = %email.hash, error = %e, "Inference failed");
                return self.fallback(email, "inference error");
            }
            Err(_) => {
                warn!(hash = %email.hash, timeout = ?self.timeout, "Inference timed out");
                return self.fallback(email, "inference timeout");
            }
        };

        let Some(category) = Category::from_label(&label.label) else {
            warn!(hash = %email.hash, label = %label.label, "Model returned unknown label");
            return self.fallback(email, "unknown label");
        };
        if !label.confidence.is_finite() || label.confidence < self.confidence_threshold {
            return self.fallback(email, "low confidence");
        }

        Classification {
            category,
            confidence: label.confidence.clamp(0.0, 1.0),
            method: ClassificationMethod::Model,
        }
    }

    fn uses_inference(&self) -> bool {
        true
    }
}

/// Build the strategy an agent's configuration asks for.
///
/// `use_ai_model` without a usable client degrades to rules with a warning.
pub fn build_classifier(
    config: &ClassificationSection,
    client: Option<Arc<dyn InferenceClient>>,
) -> Arc<dyn Classifier> {
    match (config.use_ai_model, client) {
        (true, Some(client)) => Arc::new(ModelClassifier::new(
            client,
            Duration::from_secs(config.inference_timeout_secs),
            config.confidence_threshold,
        )),
        (true, None) => {
            warn!("use_ai_model is set but no inference endpoint is configured, using rules");
            Arc::new(RuleClassifier::default_rules())
        }
        (false, _) => Arc::new(RuleClassifier::default_rules()),
    }
}

/// `[SUBJECT] … [SENDER] … [BODY] …`, whitespace collapsed, body truncated.
pub fn model_input(email: &ParsedEmail) -> String {
    let sender = match &email.from_name {
        Some(name) => format!("{name} <{}>", email.from_address),
        None => format!("<{}>", email.from_address),
    };
    let body: String = email.body_excerpt.chars().take(MODEL_BODY_CHARS).collect();
    let text = format!(
        "[SUBJECT] {} [SENDER] {} [BODY] {}",
        email.subject, sender, body
    );
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
