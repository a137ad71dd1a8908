//! Client for the visual grounding / inference service.
//!
//! Grounding is the one place the symbolic trace meets the live screen:
//! the service receives the task, the current step's annotations, the trace
//! listing, a fresh screenshot, and a bounded history window, and answers
//! with a concrete action (or a rejection when the described element cannot
//! be resolved). Keeping it behind the [`Grounder`] trait lets the loop
//! re-query with updated context after a failed attempt, and lets tests
//! swap in stubs.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{AgentError, Result};
use crate::screen::{GroundedAction, Screenshot};
use crate::trace::TraceStep;

/// What the grounding service resolved the current step to.
#[derive(Debug, Clone)]
pub enum GroundingOutcome {
    /// A concrete action to execute for this step.
    Resolved(GroundedAction),
    /// The service judged the whole task already done; no action to take.
    Complete,
}

/// Post-execution check of a step's stated expectation.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub met: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Everything one grounding or verification call carries.
pub struct GroundingRequest<'a> {
    pub session_id: &'a str,
    pub task: &'a str,
    pub trace_id: &'a str,
    /// The `Step [i]: <action>` listing of the whole trace.
    pub guidance: &'a str,
    pub step: &'a TraceStep,
    pub screenshot: &'a Screenshot,
    /// Bounded window of prior attempt summaries, oldest first.
    pub history: &'a [String],
}

#[async_trait]
pub trait Grounder: Send + Sync {
    /// Resolve the step against the screenshot into an executable action.
    async fn ground(&self, request: &GroundingRequest<'_>) -> Result<GroundingOutcome>;

    /// Check whether the step's expectation appears satisfied on screen.
    async fn verify(&self, request: &GroundingRequest<'_>) -> Result<Verification>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum RequestMode {
    Ground,
    Verify,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    session_id: &'a str,
    task: &'a str,
    trace_id: &'a str,
    mode: RequestMode,
    screenshot: String,
    step: &'a TraceStep,
    guidance_trajectory: &'a str,
    action_history: &'a [String],
}

impl<'a> WireRequest<'a> {
    fn new(request: &'a GroundingRequest<'_>, mode: RequestMode) -> Self {
        Self {
            session_id: request.session_id,
            task: request.task,
            trace_id: request.trace_id,
            mode,
            screenshot: request.screenshot.to_base64(),
            step: request.step,
            guidance_trajectory: request.guidance,
            action_history: request.history,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    status: String,
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    action: Option<GroundedAction>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    verified: Option<bool>,
    #[serde(default)]
    explanation: Option<String>,
}

/// HTTP client for the `/generate_action` boundary of the inference service.
///
/// Transport and protocol failures are retried with bounded exponential
/// backoff before escalating as `GroundingServiceError`; rejections come
/// back as `GroundingRejected` and are the loop's concern.
#[derive(Clone)]
pub struct GroundingClient {
    http: reqwest::Client,
    endpoint: String,
    request_timeout: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl GroundingClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            request_timeout: Duration::from_secs(120),
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_transport_retries(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, body: &WireRequest<'_>) -> Result<WireResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_post(body).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        attempt,
                        error = %e,
                        "grounding service request failed, backing off {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_post(&self, body: &WireRequest<'_>) -> Result<WireResponse> {
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                AgentError::GroundingServiceError(format!(
                    "request to {} failed: {e}",
                    self.endpoint
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::GroundingServiceError(format!(
                "service returned {status}: {text}"
            )));
        }

        response.json::<WireResponse>().await.map_err(|e| {
            AgentError::GroundingServiceError(format!("invalid response body: {e}"))
        })
    }
}

#[async_trait]
impl Grounder for GroundingClient {
    async fn ground(&self, request: &GroundingRequest<'_>) -> Result<GroundingOutcome> {
        debug!(
            step = request.step.step_idx,
            endpoint = %self.endpoint,
            "requesting grounding"
        );
        let response = self.post(&WireRequest::new(request, RequestMode::Ground)).await?;
        parse_grounding(response)
    }

    async fn verify(&self, request: &GroundingRequest<'_>) -> Result<Verification> {
        debug!(step = request.step.step_idx, "requesting verification");
        let response = self.post(&WireRequest::new(request, RequestMode::Verify)).await?;
        parse_verification(response)
    }
}

fn parse_grounding(response: WireResponse) -> Result<GroundingOutcome> {
    if response.status != "success" {
        let reason = response
            .reason
            .unwrap_or_else(|| format!("service reported status {:?}", response.status));
        return Err(AgentError::GroundingRejected(reason));
    }

    match response.outcome.as_deref() {
        Some("action") => {
            let action = response.action.ok_or_else(|| {
                AgentError::GroundingServiceError(
                    "outcome \"action\" carried no action descriptor".to_string(),
                )
            })?;
            Ok(GroundingOutcome::Resolved(action))
        }
        Some("complete") => Ok(GroundingOutcome::Complete),
        Some("reject") => Err(AgentError::GroundingRejected(
            response
                .reason
                .unwrap_or_else(|| "step could not be resolved against the screen".to_string()),
        )),
        other => Err(AgentError::GroundingServiceError(format!(
            "unrecognized grounding outcome {other:?}"
        ))),
    }
}

fn parse_verification(response: WireResponse) -> Result<Verification> {
    if response.status != "success" {
        return Err(AgentError::GroundingServiceError(format!(
            "verification call reported status {:?}: {}",
            response.status,
            response.reason.unwrap_or_default()
        )));
    }
    let met = response.verified.ok_or_else(|| {
        AgentError::GroundingServiceError("verification response missing \"verified\"".to_string())
    })?;
    Ok(Verification {
        met,
        explanation: response.explanation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> WireResponse {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_parse_resolved_action() {
        let outcome = parse_grounding(response(
            r#"{"status": "success", "outcome": "action", "action": {"kind": "click", "x": 412, "y": 300}}"#,
        ))
        .unwrap();
        match outcome {
            GroundingOutcome::Resolved(GroundedAction::Click { x, y, .. }) => {
                assert_eq!((x, y), (412, 300));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_parse_complete() {
        let outcome =
            parse_grounding(response(r#"{"status": "success", "outcome": "complete"}"#)).unwrap();
        assert!(matches!(outcome, GroundingOutcome::Complete));
    }

    #[test]
    fn test_parse_rejection() {
        let err = parse_grounding(response(
            r#"{"status": "success", "outcome": "reject", "reason": "no red X visible"}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, AgentError::GroundingRejected(r) if r.contains("no red X")));
    }

    #[test]
    fn test_parse_error_status_is_rejection() {
        let err = parse_grounding(response(
            r#"{"status": "error", "reason": "described element not found"}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, AgentError::GroundingRejected(_)));
    }

    #[test]
    fn test_action_outcome_without_action_is_protocol_error() {
        let err = parse_grounding(response(r#"{"status": "success", "outcome": "action"}"#))
            .unwrap_err();
        assert!(matches!(err, AgentError::GroundingServiceError(_)));
    }

    #[test]
    fn test_parse_verification() {
        let v = parse_verification(response(
            r#"{"status": "success", "verified": false, "explanation": "dialog still open"}"#,
        ))
        .unwrap();
        assert!(!v.met);
        assert_eq!(v.explanation.as_deref(), Some("dialog still open"));

        let err =
            parse_verification(response(r#"{"status": "success"}"#)).unwrap_err();
        assert!(matches!(err, AgentError::GroundingServiceError(_)));
    }
}
