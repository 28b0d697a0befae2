//! Core `StageClient` trait and `HttpStageClient` implementation.
//!
//! `HttpStageClient` POSTs the [`StageRequest`] envelope as JSON to the
//! configured endpoint and validates the [`StageResponse`] envelope that
//! comes back.  All connection details come from [`StageConfig`]; nothing is
//! hardcoded.

use async_trait::async_trait;

use crate::config::StageConfig;
use crate::stage::{StageError, StagePayload, StageRequest, StageResponse, StageStatus};

// ---------------------------------------------------------------------------
// StageClient trait
// ---------------------------------------------------------------------------

/// Async transport to one remote stage service.
///
/// Implementors must be `Send + Sync` so they can be shared across tasks as
/// `Arc<dyn StageClient>`.  One `call` is one attempt: the dispatcher owns
/// timeouts, retries, and backoff.
#[async_trait]
pub trait StageClient: Send + Sync {
    /// Perform one attempt and return the validated result payload.
    async fn call(&self, request: StageRequest) -> Result<StagePayload, StageError>;
}

// ---------------------------------------------------------------------------
// HttpStageClient
// ---------------------------------------------------------------------------

/// Calls a stage service over HTTP with the JSON envelope from
/// [`crate::stage`].
///
/// # No hardcoded URLs
/// Endpoint, credentials and timeout come exclusively from the
/// [`StageConfig`] passed to [`HttpStageClient::from_config`].
pub struct HttpStageClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpStageClient {
    /// Build an `HttpStageClient` from one stage's config.
    ///
    /// The HTTP client is pre-configured with the per-attempt timeout from
    /// `config.timeout_secs`.  A default (no-timeout) client is used as a
    /// last-resort fallback if the builder fails (should never happen in
    /// practice) — the dispatcher's own timeout still bounds the attempt.
    pub fn from_config(config: &StageConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl StageClient for HttpStageClient {
    /// POST `request` to the configured endpoint.
    ///
    /// The `Authorization: Bearer …` header is attached **only** when
    /// `api_key` is a non-empty string — safe for unauthenticated local
    /// services.
    ///
    /// A response whose correlation id differs from the request's is a
    /// stale or misrouted answer and is rejected as a protocol error — the
    /// sole defense (together with the registry's state guard) against the
    /// transport's at-least-once duplication.
    async fn call(&self, request: StageRequest) -> Result<StagePayload, StageError> {
        let mut req = self.client.post(&self.endpoint).json(&request);

        let key = self.api_key.as_deref().unwrap_or("");
        if !key.is_empty() {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        if !response.status().is_success() {
            return Err(StageError::Remote(format!("HTTP {}", response.status())));
        }

        let envelope: StageResponse = response
            .json()
            .await
            .map_err(|e| StageError::Protocol(e.to_string()))?;

        if envelope.correlation_id != request.correlation_id {
            return Err(StageError::Protocol(format!(
                "correlation mismatch: sent {}, got {}",
                request.correlation_id, envelope.correlation_id
            )));
        }

        match envelope.status {
            StageStatus::Ok => envelope
                .payload
                .ok_or_else(|| StageError::Protocol("ok response without payload".into())),
            StageStatus::Error => Err(StageError::Remote(
                envelope.error.unwrap_or_else(|| "unspecified".into()),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// MockStageClient (test double)
// ---------------------------------------------------------------------------

/// Scripted stage client for tests.
///
/// Pops one scripted result per call; when the script runs dry it repeats
/// the configured fallback.  Every received request is recorded for
/// assertions.
#[cfg(test)]
pub struct MockStageClient {
    script: std::sync::Mutex<std::collections::VecDeque<Result<StagePayload, StageError>>>,
    fallback: Result<StagePayload, StageError>,
    calls: std::sync::Mutex<Vec<StageRequest>>,
}

#[cfg(test)]
impl MockStageClient {
    /// Always answer with `payload`.
    pub fn ok(payload: StagePayload) -> Self {
        Self {
            script: std::sync::Mutex::new(std::collections::VecDeque::new()),
            fallback: Ok(payload),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Always answer with `error`.
    pub fn failing(error: StageError) -> Self {
        Self {
            script: std::sync::Mutex::new(std::collections::VecDeque::new()),
            fallback: Err(error),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Answer the first calls from `script`, then fall back to `fallback`.
    pub fn scripted(
        script: Vec<Result<StagePayload, StageError>>,
        fallback: Result<StagePayload, StageError>,
    ) -> Self {
        Self {
            script: std::sync::Mutex::new(script.into()),
            fallback,
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far.
    pub fn calls(&self) -> Vec<StageRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl StageClient for MockStageClient {
    async fn call(&self, request: StageRequest) -> Result<StagePayload, StageError> {
        self.calls.lock().unwrap().push(request);
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Stage client whose calls never complete — the attempt hangs until the
/// dispatcher times it out or the session shuts down.
#[cfg(test)]
pub struct PendingStageClient;

#[cfg(test)]
#[async_trait]
impl StageClient for PendingStageClient {
    async fn call(&self, _request: StageRequest) -> Result<StagePayload, StageError> {
        std::future::pending().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{CorrelationId, Stage};
    use crate::turn::{SessionId, SpeakerId, TurnId};

    fn request() -> StageRequest {
        let turn = TurnId::new(SessionId(1), SpeakerId(1), 0);
        StageRequest {
            correlation_id: CorrelationId::new(turn, Stage::Generate, 0),
            turn_id: turn,
            stage: Stage::Generate,
            payload: StagePayload::Text("hello".into()),
            timeout_secs: 5,
        }
    }

    fn stage_config(api_key: Option<&str>) -> StageConfig {
        let mut config = crate::config::StagesConfig::default().generate;
        config.api_key = api_key.map(|s| s.to_string());
        config
    }

    #[test]
    fn from_config_builds_without_panic() {
        let _client = HttpStageClient::from_config(&stage_config(None));
    }

    #[test]
    fn from_config_accepts_empty_api_key() {
        let _client = HttpStageClient::from_config(&stage_config(Some("")));
    }

    #[test]
    fn from_config_accepts_real_api_key() {
        let _client = HttpStageClient::from_config(&stage_config(Some("sk-test-1234")));
    }

    /// Verify that `HttpStageClient` is object-safe (usable as
    /// `dyn StageClient`).
    #[test]
    fn client_is_object_safe() {
        let client: Box<dyn StageClient> =
            Box::new(HttpStageClient::from_config(&stage_config(None)));
        drop(client);
    }

    #[tokio::test]
    async fn mock_replays_script_then_fallback() {
        let client = MockStageClient::scripted(
            vec![Err(StageError::Timeout)],
            Ok(StagePayload::Text("ok".into())),
        );

        assert!(matches!(client.call(request()).await, Err(StageError::Timeout)));
        assert_eq!(
            client.call(request()).await.unwrap(),
            StagePayload::Text("ok".into())
        );
        assert_eq!(client.calls().len(), 2);
    }

    #[tokio::test]
    async fn mock_records_request_envelopes() {
        let client = MockStageClient::ok(StagePayload::Text("x".into()));
        let _ = client.call(request()).await;

        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].stage, Stage::Generate);
        assert_eq!(calls[0].correlation_id.attempt, 0);
    }
}
