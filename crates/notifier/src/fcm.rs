//! FCM HTTP multicast transport

use crate::{PushError, PushPayload, PushTransport, TokenOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Default FCM multicast endpoint
pub const DEFAULT_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";

/// FCM accepts at most this many registration IDs per request
const MAX_TOKENS_PER_REQUEST: usize = 1000;

/// Errors meaning the token will never be deliverable again
const PERMANENT_ERRORS: &[&str] = &["NotRegistered", "InvalidRegistration", "MissingRegistration"];

/// FCM transport configuration
#[derive(Debug, Clone)]
pub struct FcmConfig {
    /// Multicast endpoint URL
    pub endpoint: String,
    /// Server key sent as `Authorization: key=...`
    pub server_key: String,
    /// HTTP request timeout
    pub timeout: Duration,
}

impl FcmConfig {
    pub fn new(server_key: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            server_key: server_key.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Serialize)]
struct MulticastRequest<'a> {
    registration_ids: &'a [String],
    priority: &'static str,
    notification: Notification<'a>,
    data: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct Notification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct MulticastResponse {
    #[serde(default)]
    results: Vec<MulticastResult>,
}

#[derive(Deserialize)]
struct MulticastResult {
    message_id: Option<String>,
    error: Option<String>,
}

/// Map a multicast response body to per-token outcomes
fn parse_response(expected: usize, body: &[u8]) -> Result<Vec<TokenOutcome>, PushError> {
    let response: MulticastResponse =
        serde_json::from_slice(body).map_err(|e| PushError::InvalidResponse(e.to_string()))?;

    if response.results.len() != expected {
        return Err(PushError::InvalidResponse(format!(
            "expected {} results, got {}",
            expected,
            response.results.len()
        )));
    }

    Ok(response
        .results
        .into_iter()
        .map(|result| match (result.message_id, result.error) {
            (_, Some(error)) if PERMANENT_ERRORS.contains(&error.as_str()) => TokenOutcome::Unregistered,
            (_, Some(error)) => TokenOutcome::Failed(error),
            (Some(_), None) => TokenOutcome::Delivered,
            (None, None) => TokenOutcome::Failed("empty result".to_string()),
        })
        .collect())
}

/// Join per-request outcomes in token order.
///
/// A failed request marks only its own tokens failed, so outcomes of the
/// other requests still reach pruning. Fails only if every request failed.
fn merge_chunks(results: Vec<(usize, Result<Vec<TokenOutcome>, PushError>)>) -> Result<Vec<TokenOutcome>, PushError> {
    let mut outcomes = Vec::new();
    let mut last_error = None;
    let mut any_sent = false;

    for (len, result) in results {
        match result {
            Ok(chunk) => {
                any_sent = true;
                outcomes.extend(chunk);
            }
            Err(e) => {
                warn!("Push request for {} tokens failed: {}", len, e);
                let reason = e.to_string();
                outcomes.extend((0..len).map(|_| TokenOutcome::Failed(reason.clone())));
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) if !any_sent => Err(e),
        _ => Ok(outcomes),
    }
}

/// Push transport speaking the FCM HTTP multicast protocol
pub struct FcmTransport {
    config: FcmConfig,
    client: reqwest::Client,
}

impl FcmTransport {
    pub fn new(config: FcmConfig) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PushError::Request(e.to_string()))?;
        Ok(Self { config, client })
    }

    async fn send_chunk(&self, tokens: &[String], payload: &PushPayload) -> Result<Vec<TokenOutcome>, PushError> {
        let request = MulticastRequest {
            registration_ids: tokens,
            priority: "high",
            notification: Notification {
                title: &payload.title,
                body: &payload.body,
            },
            data: &payload.data,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .header(reqwest::header::AUTHORIZATION, format!("key={}", self.config.server_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| PushError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| PushError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(PushError::Rejected {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        parse_response(tokens.len(), &body)
    }
}

#[async_trait]
impl PushTransport for FcmTransport {
    async fn multicast(&self, tokens: &[String], payload: &PushPayload) -> Result<Vec<TokenOutcome>, PushError> {
        let mut results = Vec::new();
        for chunk in tokens.chunks(MAX_TOKENS_PER_REQUEST) {
            debug!("Sending push to {} tokens", chunk.len());
            results.push((chunk.len(), self.send_chunk(chunk, payload).await));
        }
        merge_chunks(results)
    }
}
