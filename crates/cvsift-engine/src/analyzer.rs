// Analyzer adapter.
//
// The engine treats analysis as an opaque call: bytes reference plus job
// description in, structured JSON out. Errors are classified transient
// (retryable: rate-limit and server-busy signals) or permanent (everything
// else, including malformed responses); the item state machine decides what
// a classification means for the item, never the adapter.

use async_trait::async_trait;
use cvsift_core::ItemFailure;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Classified analyzer failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalyzerError {
    #[error("transient analyzer failure [{code}]: {message}")]
    Transient { code: String, message: String },

    #[error("permanent analyzer failure [{code}]: {message}")]
    Permanent { code: String, message: String },
}

impl AnalyzerError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// The failure detail recorded on the item.
    pub fn into_failure(self) -> ItemFailure {
        match self {
            Self::Transient { code, message } | Self::Permanent { code, message } => {
                ItemFailure::new(code, message)
            }
        }
    }
}

/// Opaque scoring call against the shared job description.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        file_ref: &str,
        job_description: &str,
    ) -> Result<serde_json::Value, AnalyzerError>;
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    file_ref: &'a str,
    job_description: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnalyzeErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    transient: bool,
}

/// HTTP binding of the analyzer contract.
pub struct HttpAnalyzer {
    http: reqwest::Client,
    endpoint: reqwest::Url,
}

impl HttpAnalyzer {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = reqwest::Url::parse(endpoint)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(
        &self,
        file_ref: &str,
        job_description: &str,
    ) -> Result<serde_json::Value, AnalyzerError> {
        let res = self
            .http
            .post(self.endpoint.clone())
            .json(&AnalyzeRequest {
                file_ref,
                job_description,
            })
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(classify_http_failure(status, &body));
        }

        res.json::<serde_json::Value>()
            .await
            .map_err(|e| AnalyzerError::permanent("invalid_response", e.to_string()))
    }
}

fn classify_request_error(err: reqwest::Error) -> AnalyzerError {
    if err.is_timeout() {
        AnalyzerError::transient("timeout", err.to_string())
    } else if err.is_connect() {
        AnalyzerError::transient("unreachable", err.to_string())
    } else {
        AnalyzerError::permanent("request_failed", err.to_string())
    }
}

fn classify_http_failure(status: reqwest::StatusCode, body: &str) -> AnalyzerError {
    let parsed = serde_json::from_str::<AnalyzeErrorBody>(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|b| b.code.clone())
        .unwrap_or_else(|| format!("http_{}", status.as_u16()));
    let message = parsed
        .as_ref()
        .and_then(|b| b.message.clone())
        .unwrap_or_else(|| truncate(body, 512));

    match status.as_u16() {
        // Rate-limit and server-busy signals retry; so does an explicit flag.
        429 => AnalyzerError::transient("rate_limited", message),
        503 => AnalyzerError::transient("overloaded", message),
        _ if parsed.is_some_and(|b| b.transient) => AnalyzerError::transient(code, message),
        _ => AnalyzerError::permanent(code, message),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}
