use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::models::{QuestionType, ScreeningQuestion};

pub const API_KEY_ENV: &str = "HUNT_APPLY_API_KEY";

#[derive(Debug, Error)]
pub enum BackendError {
    /// Nothing answered at all: DNS, connect or TLS failure.
    #[error("Generation backend unreachable: {0}")]
    Unreachable(String),

    #[error("Generation backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Generation request failed: {0}")]
    Request(String),

    #[error("Failed to decode generation response: {0}")]
    Decode(String),

    #[error("Generation backend returned an empty answer")]
    Empty,
}

// --- Wire types ---

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionPayload<'a> {
    pub id: &'a str,
    pub text: &'a str,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub options: Option<&'a [String]>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOptions {
    pub max_length: Option<usize>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest<'a> {
    pub question: QuestionPayload<'a>,
    pub profile: &'a serde_json::Value,
    pub options: GenerationOptions,
}

impl<'a> GenerationRequest<'a> {
    pub fn new(
        question: &'a ScreeningQuestion,
        profile: &'a serde_json::Value,
        max_tokens: u32,
    ) -> Self {
        Self {
            question: QuestionPayload {
                id: &question.id,
                text: &question.text,
                question_type: question.question_type,
                options: question.options.as_deref(),
            },
            profile,
            options: GenerationOptions {
                max_length: question.max_length,
                max_tokens,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendAnswer {
    pub answer: String,
    pub confidence: Option<f64>,
    pub token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: String,
}

// --- Backend trait ---

/// Produces an answer for one question. Futures are not `Send`: the
/// pipeline runs on a single-threaded executor.
#[async_trait(?Send)]
pub trait GenerationBackend {
    async fn generate(
        &self,
        request: &GenerationRequest<'_>,
    ) -> Result<BackendAnswer, BackendError>;

    fn name(&self) -> &str;
}

// --- HTTP backend ---

#[derive(Debug)]
pub struct HttpBackend {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            api_key: env::var(API_KEY_ENV).ok().filter(|k| !k.trim().is_empty()),
            client,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        if api_key.is_some() {
            self.api_key = api_key;
        }
        self
    }
}

#[async_trait(?Send)]
impl GenerationBackend for HttpBackend {
    async fn generate(
        &self,
        request: &GenerationRequest<'_>,
    ) -> Result<BackendAnswer, BackendError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                BackendError::Unreachable(e.to_string())
            } else {
                BackendError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorPayload>(&body)
                .map(|p| p.error)
                .unwrap_or(body);
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: message,
            });
        }

        parse_answer(&body)
    }

    fn name(&self) -> &str {
        &self.endpoint
    }
}

/// Decode a success body. An `{error}` payload or a blank answer is a failure.
pub fn parse_answer(body: &str) -> Result<BackendAnswer, BackendError> {
    if let Ok(payload) = serde_json::from_str::<ErrorPayload>(body) {
        return Err(BackendError::Request(payload.error));
    }
    let answer: BackendAnswer =
        serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))?;
    if answer.answer.trim().is_empty() {
        return Err(BackendError::Empty);
    }
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn question() -> ScreeningQuestion {
        ScreeningQuestion {
            id: "q0-abc".to_string(),
            text: "Preferred shift?".to_string(),
            question_type: QuestionType::Select,
            is_required: false,
            max_length: Some(40),
            options: Some(vec!["Day".to_string(), "Night".to_string()]),
            selector: "#shift".to_string(),
        }
    }

    #[test]
    fn test_request_wire_shape() {
        let q = question();
        let profile = json!({"name": "Ana"});
        let request = GenerationRequest::new(&q, &profile, 512);
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire,
            json!({
                "question": {"id": "q0-abc", "text": "Preferred shift?", "type": "select", "options": ["Day", "Night"]},
                "profile": {"name": "Ana"},
                "options": {"maxLength": 40, "maxTokens": 512}
            })
        );
    }

    #[test]
    fn test_parse_answer() {
        let ok = parse_answer(r#"{"answer": "Day", "confidence": 0.8, "tokenCount": 12}"#).unwrap();
        assert_eq!(ok.answer, "Day");
        assert_eq!(ok.confidence, Some(0.8));
        assert_eq!(ok.token_count, Some(12));

        let bare = parse_answer(r#"{"answer": "Night"}"#).unwrap();
        assert_eq!(bare.confidence, None);

        assert!(matches!(
            parse_answer(r#"{"error": "quota"}"#),
            Err(BackendError::Request(m)) if m == "quota"
        ));
        assert!(matches!(parse_answer(r#"{"answer": "  "}"#), Err(BackendError::Empty)));
        assert!(matches!(parse_answer("not json"), Err(BackendError::Decode(_))));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_classified() {
        // Nothing listens on port 9 on the loopback interface.
        let backend =
            HttpBackend::new("http://127.0.0.1:9/generate", Duration::from_secs(2)).unwrap();
        let q = question();
        let profile = json!({});
        let err = backend.generate(&GenerationRequest::new(&q, &profile, 64)).await.unwrap_err();
        assert!(matches!(err, BackendError::Unreachable(_)), "{:?}", err);
    }
}
