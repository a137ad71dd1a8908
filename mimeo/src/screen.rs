//! The seam between the session loop and the live desktop.
//!
//! `ScreenDriver` abstracts the two irreversible collaborators (screenshot
//! capture and OS input injection) so the loop can run against the real
//! desktop or against stubs in tests. `Screen` wraps a driver with the
//! selected display and per-call timeouts; no suspension point below it
//! blocks indefinitely.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::errors::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// The live, resolved counterpart of a trace step's symbolic action.
///
/// Coordinates are relative to the selected screen's capture; the driver
/// translates them to global desktop coordinates before injecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroundedAction {
    Click {
        x: i32,
        y: i32,
        #[serde(default)]
        button: MouseButton,
    },
    DoubleClick {
        x: i32,
        y: i32,
    },
    Drag {
        path: Vec<Point>,
    },
    Type {
        text: String,
    },
    Scroll {
        x: i32,
        y: i32,
        #[serde(default)]
        delta_x: i64,
        delta_y: i64,
    },
    Hotkey {
        keys: Vec<String>,
    },
    Wait {
        ms: u64,
    },
}

impl fmt::Display for GroundedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroundedAction::Click { x, y, button } => write!(f, "click({x}, {y}, {button:?})"),
            GroundedAction::DoubleClick { x, y } => write!(f, "double_click({x}, {y})"),
            GroundedAction::Drag { path } => write!(f, "drag({} points)", path.len()),
            GroundedAction::Type { text } => write!(f, "type({} chars)", text.chars().count()),
            GroundedAction::Scroll {
                x, y, delta_x, delta_y,
            } => write!(f, "scroll({x}, {y}, dx={delta_x}, dy={delta_y})"),
            GroundedAction::Hotkey { keys } => write!(f, "hotkey({})", keys.join("+")),
            GroundedAction::Wait { ms } => write!(f, "wait({ms}ms)"),
        }
    }
}

/// A PNG-encoded capture of one display.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Screenshot {
    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.png)
    }
}

/// Proof that an input action was dispatched to the OS.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReceipt {
    pub detail: String,
    pub elapsed_ms: u64,
}

/// Capture and input primitives for one desktop.
///
/// Implementations hold no per-call state; side effects on the live desktop
/// are real and irreversible. Failures must surface as errors, never be
/// swallowed.
#[async_trait]
pub trait ScreenDriver: Send + Sync {
    async fn capture(&self, screen: u32) -> Result<Screenshot>;

    async fn execute(&self, screen: u32, action: &GroundedAction) -> Result<ExecutionReceipt>;
}

/// A driver bound to one selected display, with per-call timeouts.
#[derive(Clone)]
pub struct Screen {
    driver: Arc<dyn ScreenDriver>,
    selected_screen: u32,
    capture_timeout: Duration,
    execute_timeout: Duration,
}

impl Screen {
    pub fn new(driver: Arc<dyn ScreenDriver>, selected_screen: u32) -> Self {
        Self {
            driver,
            selected_screen,
            capture_timeout: Duration::from_secs(10),
            execute_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeouts(mut self, capture: Duration, execute: Duration) -> Self {
        self.capture_timeout = capture;
        self.execute_timeout = execute;
        self
    }

    pub fn selected_screen(&self) -> u32 {
        self.selected_screen
    }

    pub async fn capture(&self) -> Result<Screenshot> {
        tokio::time::timeout(self.capture_timeout, self.driver.capture(self.selected_screen))
            .await
            .map_err(|_| {
                AgentError::CaptureUnavailable(format!(
                    "screen {} capture timed out after {:?}",
                    self.selected_screen, self.capture_timeout
                ))
            })?
    }

    pub async fn execute(&self, action: &GroundedAction) -> Result<ExecutionReceipt> {
        tokio::time::timeout(
            self.execute_timeout,
            self.driver.execute(self.selected_screen, action),
        )
        .await
        .map_err(|_| {
            AgentError::ExecutionError(format!(
                "{action} timed out after {:?}",
                self.execute_timeout
            ))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grounded_action_wire_format() {
        let action: GroundedAction =
            serde_json::from_str(r#"{"kind": "click", "x": 412, "y": 300}"#).unwrap();
        assert_eq!(
            action,
            GroundedAction::Click {
                x: 412,
                y: 300,
                button: MouseButton::Left
            }
        );

        let action: GroundedAction = serde_json::from_str(
            r#"{"kind": "drag", "path": [{"x": 10, "y": 20}, {"x": 30, "y": 40}]}"#,
        )
        .unwrap();
        assert!(matches!(action, GroundedAction::Drag { ref path } if path.len() == 2));

        let action: GroundedAction =
            serde_json::from_str(r#"{"kind": "hotkey", "keys": ["ctrl", "s"]}"#).unwrap();
        assert_eq!(action.to_string(), "hotkey(ctrl+s)");
    }

    #[test]
    fn test_screenshot_base64_roundtrip() {
        let shot = Screenshot {
            png: vec![0x89, 0x50, 0x4e, 0x47],
            width: 2,
            height: 2,
        };
        assert_eq!(shot.to_base64(), "iVBORw==");
    }
}
