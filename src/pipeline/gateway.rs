//! Remote vision model client.
//!
//! The pipeline only depends on `VisionClient`: prompt plus base64 image in,
//! raw text out, retries already handled.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{BackoffKind, PipelineConfig};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Cannot connect to vision endpoint at {0}")]
    Connection(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Vision endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed endpoint response: {0}")]
    Decode(String),

    #[error("HTTP client error: {0}")]
    Http(String),
}

impl GatewayError {
    /// Client-side rejections (4xx other than 408/429) will fail again.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Status { status, .. } => {
                !(400..500).contains(status) || *status == 408 || *status == 429
            }
            _ => true,
        }
    }
}

pub trait VisionClient: Send + Sync {
    /// Send `prompt` with the encoded image; returns the model's text.
    fn generate(&self, prompt: &str, image_base64: &str) -> Result<String, GatewayError>;
}

// ──────────────────────────────────────────────
// Retry policy
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: BackoffKind,
}

/// Exponential backoff stops doubling after this many steps.
const MAX_BACKOFF_DOUBLINGS: u32 = 6;

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            delay: config.retry_delay(),
            backoff: config.backoff,
        }
    }

    /// Wait before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let doublings = attempt.saturating_sub(1).min(MAX_BACKOFF_DOUBLINGS);
                self.delay * 2u32.pow(doublings)
            }
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. The last error is returned.
    pub fn run<T>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let wait = self.delay_after(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Vision call failed, retrying"
                    );
                    std::thread::sleep(wait);
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "Vision call failed");
                    return Err(e);
                }
            }
        }
    }
}

// ──────────────────────────────────────────────
// HTTP client
// ──────────────────────────────────────────────

#[derive(Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    image_base64: &'a str,
    max_tokens: u32,
    temperature: f32,
}

/// Endpoints answer with `text`; some deployments use `output` instead.
#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    output: Option<String>,
}

impl GenerateResponse {
    fn into_text(self) -> String {
        self.text
            .filter(|t| !t.is_empty())
            .or(self.output)
            .unwrap_or_default()
    }
}

/// Blocking JSON-over-HTTP client for the vision endpoint.
pub struct HttpVisionClient {
    endpoint: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl HttpVisionClient {
    pub fn new(config: &PipelineConfig) -> Result<Self, GatewayError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        Ok(Self {
            endpoint: config.endpoint_url.clone(),
            client,
            timeout_secs: config.request_timeout_secs,
            max_tokens: config.max_tokens,
            retry: RetryPolicy::from_config(config),
        })
    }

    fn send_once(&self, prompt: &str, image_base64: &str) -> Result<String, GatewayError> {
        let body = GenerateRequest {
            prompt,
            image_base64,
            max_tokens: self.max_tokens,
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_connect() {
                    GatewayError::Connection(self.endpoint.clone())
                } else if e.is_timeout() {
                    GatewayError::Timeout(self.timeout_secs)
                } else {
                    GatewayError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(parsed.into_text())
    }
}

impl VisionClient for HttpVisionClient {
    fn generate(&self, prompt: &str, image_base64: &str) -> Result<String, GatewayError> {
        let text = self.retry.run(|attempt| {
            tracing::debug!(attempt, endpoint = %self.endpoint, "Calling vision endpoint");
            self.send_once(prompt, image_base64)
        })?;

        let text = text.trim();
        if text.is_empty() {
            return Err(GatewayError::Decode("empty model response".into()));
        }
        Ok(text.to_string())
    }
}

// ──────────────────────────────────────────────
// Mock
// ──────────────────────────────────────────────

/// Mock vision client for testing: canned text or a canned failure.
pub struct MockVisionClient {
    response: Result<String, String>,
    prompts: Mutex<Vec<String>>,
}

impl MockVisionClient {
    pub fn new(response: &str) -> Self {
        Self {
            response: Ok(response.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails with a connection error naming `endpoint`.
    pub fn failing(endpoint: &str) -> Self {
        Self {
            response: Err(endpoint.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl VisionClient for MockVisionClient {
    fn generate(&self, prompt: &str, _image_base64: &str) -> Result<String, GatewayError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        match &self.response {
            Ok(text) => Ok(text.clone()),
            Err(endpoint) => Err(GatewayError::Connection(endpoint.clone())),
        }
    }
}
