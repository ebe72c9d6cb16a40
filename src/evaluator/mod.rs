use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{QuizError, Result};
use crate::store::ActiveQuestion;

const DEFAULT_EVALUATOR_API_URL: &str = "http://127.0.0.1:5005/evaluate";

/// Score/feedback pair produced by the external judge. The score is raw:
/// judges answering on a 0-100 scale are normalized by the scoring engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorVerdict {
    pub score: f64,
    #[serde(default)]
    pub feedback: String,
}

/// External free-text judge. Always treated as fallible: callers degrade
/// a failed call to a zero score, never abort on it.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, question: &ActiveQuestion, answer: &str) -> Result<EvaluatorVerdict>;
}

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub api_url: String,
    pub timeout_secs: u64,
}

impl EvaluatorConfig {
    pub fn from_env() -> Option<Self> {
        let enabled = std::env::var("EVALUATOR_ENABLED")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        if !enabled {
            return None;
        }

        let api_url = std::env::var("EVALUATOR_API_URL")
            .unwrap_or_else(|_| DEFAULT_EVALUATOR_API_URL.to_string());
        let timeout_secs = std::env::var("EVALUATOR_TIMEOUT_SECS")
            .unwrap_or_else(|_| "20".to_string())
            .parse()
            .unwrap_or(20);

        Some(Self {
            api_url,
            timeout_secs,
        })
    }
}

#[derive(Debug, Serialize)]
struct EvaluateRequest<'a> {
    question: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
    answer: &'a str,
}

pub struct HttpEvaluator {
    config: EvaluatorConfig,
    client: reqwest::Client,
}

impl HttpEvaluator {
    pub fn new(config: EvaluatorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| QuizError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(&self, question: &ActiveQuestion, answer: &str) -> Result<EvaluatorVerdict> {
        let request = EvaluateRequest {
            question: &question.title,
            prompt: question.prompt.as_deref(),
            answer,
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| QuizError::Evaluator(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(QuizError::Evaluator(format!(
                "Judge returned status {}: {}",
                status, error_text
            )));
        }

        let verdict: EvaluatorVerdict = response
            .json()
            .await
            .map_err(|e| QuizError::Evaluator(format!("Unparsable judge output: {}", e)))?;

        tracing::debug!(
            question_id = %question.id,
            score = verdict.score,
            "Evaluator verdict received"
        );

        Ok(verdict)
    }
}

/// Evaluator that refuses every call. Used when no judge is configured so
/// open-mode answers degrade the same way as a judge outage.
pub struct DisabledEvaluator;

#[async_trait]
impl Evaluator for DisabledEvaluator {
    async fn evaluate(&self, _question: &ActiveQuestion, _answer: &str) -> Result<EvaluatorVerdict> {
        Err(QuizError::Evaluator("No evaluator configured".to_string()))
    }
}
