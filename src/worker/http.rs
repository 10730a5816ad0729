//! JSON-over-HTTP worker.
//!
//! Posts `{worker_id, prompt, context}` and expects either a JSON body with
//! a `content` field or plain text. Failures are classified for the retry
//! policy:
//! - request timeout → `Timeout`
//! - connect / transport failure, HTTP 5xx → `NetworkError`
//! - HTTP 429 → `RateLimited`
//! - any other non-success status or an unreadable body → fatal

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ExecutionContext, Invocable};
use crate::errors::CallError;

#[derive(Serialize)]
struct InvokeRequest<'a> {
    worker_id: &'a str,
    prompt: &'a str,
    context: &'a ExecutionContext,
}

#[derive(Deserialize)]
struct InvokeResponse {
    content: String,
}

pub struct HttpWorker {
    worker_id: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpWorker {
    pub fn new(worker_id: &str, endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("conductor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            worker_id: worker_id.to_string(),
            endpoint: endpoint.to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Classify a non-success HTTP status.
fn classify_status(status: StatusCode, body: &str) -> CallError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS {
        CallError::rate_limited(message)
    } else if status.is_server_error() {
        CallError::network(message)
    } else {
        CallError::fatal(message)
    }
}

fn classify_transport(err: &reqwest::Error) -> CallError {
    if err.is_timeout() {
        CallError::timeout(err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        CallError::network(err.to_string())
    } else {
        CallError::fatal(err.to_string())
    }
}

/// Extract generated content from a response body.
fn parse_content(body: &str) -> String {
    match serde_json::from_str::<InvokeResponse>(body) {
        Ok(parsed) => parsed.content,
        Err(_) => body.to_string(),
    }
}

#[async_trait]
impl Invocable for HttpWorker {
    async fn invoke(&self, prompt: &str, ctx: &ExecutionContext) -> Result<String, CallError> {
        tracing::debug!(
            worker = %self.worker_id,
            endpoint = %self.endpoint,
            attempt = ctx.attempt,
            "Invoking HTTP worker"
        );
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&InvokeRequest {
                worker_id: &self.worker_id,
                prompt,
                context: ctx,
            })
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| classify_transport(&e))?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        Ok(parse_content(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransientKind;

    fn kind(err: &CallError) -> Option<TransientKind> {
        match err {
            CallError::Transient { kind, .. } => Some(*kind),
            CallError::Fatal { .. } => None,
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            kind(&classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down")),
            Some(TransientKind::RateLimited)
        );
        assert_eq!(
            kind(&classify_status(StatusCode::BAD_GATEWAY, "")),
            Some(TransientKind::NetworkError)
        );
        assert_eq!(kind(&classify_status(StatusCode::BAD_REQUEST, "bad prompt")), None);
        assert!(
            classify_status(StatusCode::UNAUTHORIZED, "no key")
                .to_string()
                .contains("HTTP 401")
        );
    }

    #[test]
    fn test_parse_content() {
        assert_eq!(parse_content(r#"{"content":"hello"}"#), "hello");
        assert_eq!(parse_content("plain text"), "plain text");
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        // Port 9 (discard) is almost never listening on loopback.
        let worker = HttpWorker::new("w", "http://127.0.0.1:9/generate", Duration::from_secs(2)).unwrap();
        let err = worker
            .invoke("hi", &ExecutionContext::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
