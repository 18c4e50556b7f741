//! Vision OCR client.
//!
//! Talks to an Ollama-style `/api/chat` endpoint: one page image per request,
//! base64-encoded, non-streaming. The service is slow and occasionally
//! returns a soft failure as HTTP 200 with an `error` body, so both transport
//! failures and error bodies count as failed attempts and are retried with
//! exponential backoff.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the OCR client.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Converts one page image into text. The seam is a trait so the pipeline can
/// be exercised against scripted recognizers in tests.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image: &[u8], prompt: &str) -> Result<String, OcrError>;
}

/// OCR client for a remote vision model.
pub struct OcrClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    retries: u32,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatResponseMessage>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl OcrClient {
    /// Create a new client against the given base URL.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: std::time::Duration,
        retries: u32,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            retries: retries.max(1),
        }
    }

    /// One request to the vision endpoint. Returns the failure detail as a
    /// string so the retry loop can carry it into the final error.
    async fn attempt(&self, payload: &ChatRequest) -> Result<String, String> {
        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| format!("connection error: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("HTTP {}: {}", status, body.trim()));
        }

        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| format!("parse error: {e}"))?;

        // The service reports transient overload as 200 + error body.
        if let Some(error) = chat.error {
            return Err(format!("service error: {error}"));
        }

        chat.message
            .and_then(|m| m.content)
            .ok_or_else(|| "response missing message.content".to_string())
    }
}

#[async_trait]
impl TextRecognizer for OcrClient {
    async fn recognize(&self, image: &[u8], prompt: &str) -> Result<String, OcrError> {
        let b64_image = base64::engine::general_purpose::STANDARD.encode(image);
        let payload = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
                images: vec![b64_image],
            }],
            stream: false,
        };

        let mut last_error = String::new();
        for attempt in 1..=self.retries {
            match self.attempt(&payload).await {
                Ok(text) => return Ok(text),
                Err(detail) => {
                    last_error = detail;
                    if attempt < self.retries {
                        let wait = 1u64 << (attempt - 1);
                        tracing::warn!(
                            "OCR attempt {} failed: {}. Retrying in {}s...",
                            attempt,
                            last_error,
                            wait
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
                    }
                }
            }
        }

        Err(OcrError::Exhausted {
            attempts: self.retries,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use axum::{extract::State, routing::post, Json, Router};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Scripted = Arc<Mutex<VecDeque<(u16, serde_json::Value)>>>;

    /// Serve scripted responses from an in-process endpoint; the last
    /// response repeats once the script runs dry.
    async fn spawn_stub(responses: Vec<(u16, serde_json::Value)>) -> String {
        let script: Scripted = Arc::new(Mutex::new(responses.into_iter().collect()));

        async fn chat(State(script): State<Scripted>) -> axum::response::Response {
            let (status, body) = {
                let mut queue = script.lock().unwrap();
                if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap()
                }
            };
            (
                axum::http::StatusCode::from_u16(status).unwrap(),
                Json(body),
            )
                .into_response()
        }

        let app = Router::new()
            .route("/api/chat", post(chat))
            .with_state(script);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn success_body(text: &str) -> serde_json::Value {
        serde_json::json!({"message": {"content": text}})
    }

    #[tokio::test]
    async fn test_recognize_returns_content() {
        let base = spawn_stub(vec![(200, success_body("Mocked OCR text for testing."))]).await;
        let client = OcrClient::new(base, "test-model", Duration::from_secs(5), 1);

        let text = client.recognize(b"jpegbytes", "extract").await.unwrap();
        assert_eq!(text, "Mocked OCR text for testing.");
    }

    #[tokio::test]
    async fn test_http_error_exhausts_attempts() {
        let base = spawn_stub(vec![(500, serde_json::json!({"detail": "boom"}))]).await;
        let client = OcrClient::new(base, "test-model", Duration::from_secs(5), 1);

        let err = client.recognize(b"img", "p").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("after 1 attempts"), "{msg}");
        assert!(msg.contains("500"), "{msg}");
    }

    #[tokio::test]
    async fn test_error_body_counts_as_failure() {
        let base = spawn_stub(vec![(
            200,
            serde_json::json!({"error": "model is busy, please try again later"}),
        )])
        .await;
        let client = OcrClient::new(base, "test-model", Duration::from_secs(5), 1);

        let err = client.recognize(b"img", "p").await.unwrap_err();
        assert!(err.to_string().contains("model is busy"), "{err}");
    }

    #[tokio::test]
    async fn test_missing_content_counts_as_failure() {
        let base = spawn_stub(vec![(200, serde_json::json!({"message": {}}))]).await;
        let client = OcrClient::new(base, "test-model", Duration::from_secs(5), 1);

        let err = client.recognize(b"img", "p").await.unwrap_err();
        assert!(err.to_string().contains("message.content"), "{err}");
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failure() {
        let base = spawn_stub(vec![
            (500, serde_json::json!({})),
            (200, success_body("recovered")),
        ])
        .await;
        let client = OcrClient::new(base, "test-model", Duration::from_secs(5), 3);

        let text = client.recognize(b"img", "p").await.unwrap();
        assert_eq!(text, "recovered");
    }
}
