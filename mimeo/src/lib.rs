//! Trace-grounded desktop task replay.
//!
//! mimeo turns a single human demonstration into a reusable workflow: an
//! authoring pipeline records the demonstration as an annotated trace of
//! abstract steps, and at run time each step is grounded against the live
//! screen by a vision-language inference service, executed through OS input
//! primitives, and verified before the loop advances. Grounding per step,
//! rather than replaying recorded coordinates, is what lets one recording
//! survive layout drift, renamed menu items, and resized windows.
//!
//! The crate is organized around five pieces:
//!
//! - [`trace`]: loading and validation of recorded traces
//! - [`screen`] / [`desktop`]: the capture/inject seam and its real driver
//! - [`grounding`]: the inference-service client behind the [`Grounder`] trait
//! - [`session`]: the capture/ground/execute/verify state machine
//! - [`registry`]: single-slot ownership of the active session

pub mod desktop;
pub mod errors;
pub mod grounding;
pub mod registry;
pub mod screen;
pub mod session;
pub mod trace;

pub use desktop::DesktopDriver;
pub use errors::{AgentError, Result};
pub use grounding::{
    Grounder, GroundingClient, GroundingOutcome, GroundingRequest, Verification,
};
pub use registry::SessionRegistry;
pub use screen::{
    ExecutionReceipt, GroundedAction, MouseButton, Point, Screen, ScreenDriver, Screenshot,
};
pub use session::{
    Session, SessionConfig, SessionHandle, SessionSnapshot, SessionStatus, StepDisposition,
    StepRecord,
};
pub use trace::{Trace, TraceStep, TraceStore};
