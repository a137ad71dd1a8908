//! The session state machine.
//!
//! A [`Session`] owns one task instance's run state and drives the loop:
//! capture the screen, ground the current trace step against it, execute
//! the resolved action, verify the step's expectation, then advance. The
//! loop is the sole writer of session state; observers (status polls, the
//! stop signal) see an [`Arc`]-shared snapshot the loop publishes after
//! every mutation, and a cancellation token that is only read between
//! steps, so a dispatched OS action always completes or errors on its own.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{AgentError, Result};
use crate::grounding::{Grounder, GroundingOutcome, GroundingRequest, Verification};
use crate::screen::{GroundedAction, Screen};
use crate::trace::{Trace, TraceStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Stopped | SessionStatus::Failed
        )
    }
}

/// Caller-chosen parameters for one task run.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub task: String,
    pub trace_id: String,
    pub selected_screen: u32,
    /// Ceiling on executed steps. Exhausting the budget is a success
    /// condition, not a failure.
    pub max_steps: u32,
    /// Attempts per step before the session fails on a transient error.
    pub retry_limit: u32,
    /// Consecutive negative verifications tolerated before the session
    /// fails. Expectation text is imprecise, so isolated mismatches are
    /// informational only. 0 disables escalation.
    pub verify_failure_limit: u32,
    /// How many prior attempt summaries each grounding request carries.
    pub history_window: usize,
    /// Delay between steps so the UI settles before the next capture.
    pub step_pacing: Duration,
}

impl SessionConfig {
    pub fn new(task: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            trace_id: trace_id.into(),
            selected_screen: 0,
            max_steps: 50,
            retry_limit: 3,
            verify_failure_limit: 3,
            history_window: 10,
            step_pacing: Duration::from_secs(1),
        }
    }
}

/// How one execution attempt ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepDisposition {
    Executed {
        #[serde(skip_serializing_if = "Option::is_none")]
        verification: Option<Verification>,
    },
    CaptureFailed {
        reason: String,
    },
    GroundingRejected {
        reason: String,
    },
    ExecutionFailed {
        reason: String,
    },
}

/// One entry of session history: a single execution attempt of one trace
/// step, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step_idx: u32,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<GroundedAction>,
    pub disposition: StepDisposition,
}

impl StepRecord {
    /// One-line summary fed back to the grounding service as history.
    pub fn summary(&self) -> String {
        match &self.disposition {
            StepDisposition::Executed { verification } => {
                let verified = match verification {
                    Some(v) if v.met => "expectation met",
                    Some(_) => "expectation not met",
                    None => "unverified",
                };
                let action = self
                    .action
                    .as_ref()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string());
                format!(
                    "Executed trace step [{}]: {action} ({verified})",
                    self.step_idx
                )
            }
            StepDisposition::CaptureFailed { reason } => format!(
                "Step [{}] attempt {}: capture failed: {reason}",
                self.step_idx, self.attempt
            ),
            StepDisposition::GroundingRejected { reason } => format!(
                "Step [{}] attempt {}: grounding rejected: {reason}",
                self.step_idx, self.attempt
            ),
            StepDisposition::ExecutionFailed { reason } => format!(
                "Step [{}] attempt {}: execution failed: {reason}",
                self.step_idx, self.attempt
            ),
        }
    }
}

/// Observable state of a session at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub task: String,
    pub trace_id: String,
    pub status: SessionStatus,
    pub current_step_idx: u32,
    pub history: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Shared view of a running (or finished) session.
///
/// The loop writes through this handle; everyone else reads snapshots or
/// raises the stop flag. Status transitions are one-directional: a
/// terminal session never resurrects, so stopping one is a no-op.
pub struct SessionHandle {
    session_id: String,
    cancel: CancellationToken,
    snapshot: RwLock<SessionSnapshot>,
}

impl SessionHandle {
    fn new(session_id: String, config: &SessionConfig) -> Self {
        let snapshot = SessionSnapshot {
            session_id: session_id.clone(),
            task: config.task.clone(),
            trace_id: config.trace_id.clone(),
            status: SessionStatus::Created,
            current_step_idx: 0,
            history: Vec::new(),
            last_error: None,
        };
        Self {
            session_id,
            cancel: CancellationToken::new(),
            snapshot: RwLock::new(snapshot),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().unwrap().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot.read().unwrap().status
    }

    /// Raise the stop flag. Observed at the top of the next loop
    /// iteration; never interrupts an in-flight OS action. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

enum StepFlow {
    Advance,
    Complete,
}

/// One task instance: the trace, the collaborators, and the loop.
pub struct Session {
    config: SessionConfig,
    trace: Trace,
    guidance: String,
    screen: Screen,
    grounder: Arc<dyn Grounder>,
    handle: Arc<SessionHandle>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        trace: Trace,
        screen: Screen,
        grounder: Arc<dyn Grounder>,
    ) -> Self {
        let session_id = format!(
            "{}_{}",
            config.trace_id,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let handle = Arc::new(SessionHandle::new(session_id, &config));
        let guidance = trace.guidance();
        Self {
            config,
            trace,
            guidance,
            screen,
            grounder,
            handle,
        }
    }

    pub fn handle(&self) -> Arc<SessionHandle> {
        self.handle.clone()
    }

    /// Drive the session to a terminal status and return the final snapshot.
    pub async fn run(self) -> SessionSnapshot {
        info!(
            session_id = %self.handle.session_id,
            trace_id = %self.config.trace_id,
            max_steps = self.config.max_steps,
            "session starting"
        );
        self.transition(SessionStatus::Running);

        let mut current_step_idx: u32 = 0;
        let mut verify_failures: u32 = 0;

        loop {
            if self.handle.cancel.is_cancelled() {
                info!(session_id = %self.handle.session_id, "stop observed, halting session");
                self.transition(SessionStatus::Stopped);
                break;
            }
            if current_step_idx >= self.config.max_steps {
                info!(
                    session_id = %self.handle.session_id,
                    "step budget exhausted, completing"
                );
                self.transition(SessionStatus::Completed);
                break;
            }
            let Some(step) = self.trace.next_step(current_step_idx) else {
                info!(session_id = %self.handle.session_id, "trace exhausted, completing");
                self.transition(SessionStatus::Completed);
                break;
            };
            let step = step.clone();

            match self.run_step(&step, &mut verify_failures).await {
                Ok(StepFlow::Advance) => {
                    current_step_idx = step.step_idx;
                    self.set_current_step(current_step_idx);
                    self.pace().await;
                }
                Ok(StepFlow::Complete) => {
                    info!(
                        session_id = %self.handle.session_id,
                        step = step.step_idx,
                        "grounding service reported task complete"
                    );
                    self.transition(SessionStatus::Completed);
                    break;
                }
                Err(e) => {
                    warn!(
                        session_id = %self.handle.session_id,
                        step = step.step_idx,
                        error = %e,
                        "session failed"
                    );
                    self.fail(e);
                    break;
                }
            }
        }

        let snapshot = self.handle.snapshot();
        info!(
            session_id = %self.handle.session_id,
            status = ?snapshot.status,
            steps_executed = snapshot.current_step_idx,
            attempts = snapshot.history.len(),
            "session finished"
        );
        snapshot
    }

    /// Run one trace step to success, retrying transient failures up to the
    /// configured bound. Every attempt leaves a history record.
    async fn run_step(&self, step: &TraceStep, verify_failures: &mut u32) -> Result<StepFlow> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.attempt_step(step, attempt, verify_failures).await {
                Ok(flow) => return Ok(flow),
                Err(e) if e.is_transient() && attempt < self.config.retry_limit => {
                    warn!(
                        step = step.step_idx,
                        attempt,
                        error = %e,
                        "step attempt failed, retrying with fresh capture"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt_step(
        &self,
        step: &TraceStep,
        attempt: u32,
        verify_failures: &mut u32,
    ) -> Result<StepFlow> {
        debug!(step = step.step_idx, attempt, action = %step.action, "attempting step");

        let screenshot = match self.screen.capture().await {
            Ok(s) => s,
            Err(e) => {
                self.record(StepRecord {
                    step_idx: step.step_idx,
                    attempt,
                    action: None,
                    disposition: StepDisposition::CaptureFailed {
                        reason: e.to_string(),
                    },
                });
                return Err(e);
            }
        };

        let history = self.history_lines();
        let request = GroundingRequest {
            session_id: &self.handle.session_id,
            task: &self.config.task,
            trace_id: &self.config.trace_id,
            guidance: &self.guidance,
            step,
            screenshot: &screenshot,
            history: &history,
        };

        let action = match self.grounder.ground(&request).await {
            Ok(GroundingOutcome::Resolved(action)) => action,
            Ok(GroundingOutcome::Complete) => return Ok(StepFlow::Complete),
            Err(e) => {
                self.record(StepRecord {
                    step_idx: step.step_idx,
                    attempt,
                    action: None,
                    disposition: StepDisposition::GroundingRejected {
                        reason: e.to_string(),
                    },
                });
                return Err(e);
            }
        };

        match self.screen.execute(&action).await {
            Ok(receipt) => {
                debug!(step = step.step_idx, %action, detail = %receipt.detail, "action executed");
            }
            Err(e) => {
                self.record(StepRecord {
                    step_idx: step.step_idx,
                    attempt,
                    action: Some(action),
                    disposition: StepDisposition::ExecutionFailed {
                        reason: e.to_string(),
                    },
                });
                return Err(e);
            }
        }

        let verification = self.verify_step(step).await;
        match &verification {
            Some(v) if v.met => *verify_failures = 0,
            Some(v) => {
                *verify_failures += 1;
                warn!(
                    step = step.step_idx,
                    consecutive_misses = *verify_failures,
                    explanation = v.explanation.as_deref().unwrap_or(""),
                    "expectation not met"
                );
            }
            None => {}
        }
        let escalate = self.config.verify_failure_limit > 0
            && *verify_failures >= self.config.verify_failure_limit;

        self.record(StepRecord {
            step_idx: step.step_idx,
            attempt,
            action: Some(action),
            disposition: StepDisposition::Executed { verification },
        });

        if escalate {
            return Err(AgentError::ExpectationNotMet(format!(
                "{} consecutive steps missed their expectation",
                *verify_failures
            )));
        }
        Ok(StepFlow::Advance)
    }

    /// Check the step's expectation against a fresh capture. The action has
    /// already landed on the desktop, so failures here never retry the
    /// step: a capture or transport problem records the step as unverified
    /// instead of re-executing a live action.
    async fn verify_step(&self, step: &TraceStep) -> Option<Verification> {
        if step.expectation.trim().is_empty() {
            return None;
        }

        let screenshot = match self.screen.capture().await {
            Ok(s) => s,
            Err(e) => {
                warn!(step = step.step_idx, error = %e, "verification capture failed, recording as unverified");
                return None;
            }
        };

        let history = self.history_lines();
        let request = GroundingRequest {
            session_id: &self.handle.session_id,
            task: &self.config.task,
            trace_id: &self.config.trace_id,
            guidance: &self.guidance,
            step,
            screenshot: &screenshot,
            history: &history,
        };

        match self.grounder.verify(&request).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(step = step.step_idx, error = %e, "verification call failed, recording as unverified");
                None
            }
        }
    }

    async fn pace(&self) {
        if self.config.step_pacing.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.handle.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.config.step_pacing) => {}
        }
    }

    fn history_lines(&self) -> Vec<String> {
        let snapshot = self.handle.snapshot.read().unwrap();
        let start = snapshot
            .history
            .len()
            .saturating_sub(self.config.history_window);
        snapshot.history[start..]
            .iter()
            .map(|r| r.summary())
            .collect()
    }

    fn record(&self, record: StepRecord) {
        self.handle.snapshot.write().unwrap().history.push(record);
    }

    fn set_current_step(&self, idx: u32) {
        self.handle.snapshot.write().unwrap().current_step_idx = idx;
    }

    fn transition(&self, next: SessionStatus) {
        let mut snapshot = self.handle.snapshot.write().unwrap();
        if snapshot.status.is_terminal() {
            return;
        }
        snapshot.status = next;
    }

    fn fail(&self, error: AgentError) {
        let mut snapshot = self.handle.snapshot.write().unwrap();
        if snapshot.status.is_terminal() {
            return;
        }
        snapshot.status = SessionStatus::Failed;
        snapshot.last_error = Some(error.to_string());
    }
}
