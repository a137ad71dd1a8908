//! Single-slot ownership of the active session.
//!
//! Desktop automation is single-operator: two sessions would fight over the
//! same input devices, so exactly one may run per registry. The slot is an
//! explicit owned resource rather than process-global state, so tests and
//! embedders can construct independent instances.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::errors::{AgentError, Result};
use crate::session::{SessionHandle, SessionSnapshot};

#[derive(Default)]
pub struct SessionRegistry {
    active: Mutex<Option<Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` as the active session. Fails with `SessionBusy`
    /// while a non-terminal session occupies the slot; a finished session
    /// is displaced (it stays readable through its own handle).
    pub async fn begin(&self, handle: Arc<SessionHandle>) -> Result<()> {
        let mut slot = self.active.lock().await;
        if let Some(existing) = slot.as_ref() {
            if !existing.status().is_terminal() {
                return Err(AgentError::SessionBusy(existing.session_id().to_string()));
            }
        }
        info!(session_id = handle.session_id(), "session installed");
        *slot = Some(handle);
        Ok(())
    }

    /// Raise the stop flag on the active session, if any. Idempotent:
    /// stopping an absent or already-terminal session is a no-op.
    pub async fn stop(&self) {
        if let Some(handle) = self.active.lock().await.as_ref() {
            info!(session_id = handle.session_id(), "stop requested");
            handle.stop();
        }
    }

    /// Snapshot of the most recent session, terminal or not. Survives
    /// termination so callers can poll the final state.
    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|handle| handle.snapshot())
    }
}
