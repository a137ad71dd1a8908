use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Trace not found: {0}")]
    TraceNotFound(String),

    #[error("Trace malformed: {0}")]
    TraceMalformed(String),

    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Grounding rejected: {0}")]
    GroundingRejected(String),

    #[error("Grounding service error: {0}")]
    GroundingServiceError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Expectation not met: {0}")]
    ExpectationNotMet(String),

    #[error("Session busy: {0}")]
    SessionBusy(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl AgentError {
    /// Whether the session loop may retry the current step after this error.
    /// Everything else aborts the session without further attempts.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::CaptureUnavailable(_)
                | AgentError::GroundingRejected(_)
                | AgentError::GroundingServiceError(_)
                | AgentError::ExecutionError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
