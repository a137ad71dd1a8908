//! Concrete [`ScreenDriver`](crate::screen::ScreenDriver) for a real desktop.
//!
//! Capture goes through `xcap`; input injection goes through `rdev`
//! simulated events. Both run on the blocking pool since neither API is
//! async. Grounded coordinates are relative to the selected screen's
//! capture and are translated to global desktop coordinates against the
//! monitor origin before injection.

use std::io::Cursor;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdev::{simulate, Button, EventType, Key};
use tracing::debug;

use crate::errors::{AgentError, Result};
use crate::screen::{
    ExecutionReceipt, GroundedAction, MouseButton, Point, ScreenDriver, Screenshot,
};

/// Origin and size of one monitor in global desktop coordinates.
#[derive(Debug, Clone, Copy)]
struct MonitorRegion {
    x: i32,
    y: i32,
    width: u32,
    height: u32,
}

pub struct DesktopDriver {
    /// Pause between injected events so the OS input queue keeps up.
    event_delay: Duration,
}

impl Default for DesktopDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DesktopDriver {
    pub fn new() -> Self {
        Self {
            event_delay: Duration::from_millis(20),
        }
    }

    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }
}

#[async_trait]
impl ScreenDriver for DesktopDriver {
    async fn capture(&self, screen: u32) -> Result<Screenshot> {
        tokio::task::spawn_blocking(move || {
            let monitor = select_monitor(screen).map_err(AgentError::CaptureUnavailable)?;
            let image = monitor
                .capture_image()
                .map_err(|e| AgentError::CaptureUnavailable(format!("screen {screen}: {e}")))?;

            let (width, height) = (image.width(), image.height());
            let buffer = image::RgbaImage::from_raw(width, height, image.to_vec())
                .ok_or_else(|| {
                    AgentError::CaptureUnavailable("capture returned truncated pixel data".to_string())
                })?;
            let mut png = Vec::new();
            image::DynamicImage::ImageRgba8(buffer)
                .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
                .map_err(|e| {
                    AgentError::CaptureUnavailable(format!("png encoding failed: {e}"))
                })?;

            debug!(screen, width, height, bytes = png.len(), "captured screen");
            Ok(Screenshot { png, width, height })
        })
        .await
        .map_err(|e| AgentError::CaptureUnavailable(format!("capture task panicked: {e}")))?
    }

    async fn execute(&self, screen: u32, action: &GroundedAction) -> Result<ExecutionReceipt> {
        let action = action.clone();
        let delay = self.event_delay;
        tokio::task::spawn_blocking(move || execute_blocking(screen, &action, delay))
            .await
            .map_err(|e| AgentError::ExecutionError(format!("input task panicked: {e}")))?
    }
}

fn select_monitor(screen: u32) -> std::result::Result<xcap::Monitor, String> {
    let mut monitors =
        xcap::Monitor::all().map_err(|e| format!("failed to enumerate monitors: {e}"))?;
    if monitors.is_empty() {
        return Err("no monitors detected".to_string());
    }
    // Order by x-origin so screen indices are stable left-to-right.
    monitors.sort_by_key(|m| m.x().unwrap_or(0));

    let available = monitors.len();
    monitors
        .into_iter()
        .nth(screen as usize)
        .ok_or_else(|| format!("screen {screen} is not connected ({available} available)"))
}

fn monitor_region(screen: u32) -> Result<MonitorRegion> {
    let monitor = select_monitor(screen).map_err(AgentError::ExecutionError)?;
    Ok(MonitorRegion {
        x: monitor
            .x()
            .map_err(|e| AgentError::ExecutionError(format!("monitor origin: {e}")))?,
        y: monitor
            .y()
            .map_err(|e| AgentError::ExecutionError(format!("monitor origin: {e}")))?,
        width: monitor
            .width()
            .map_err(|e| AgentError::ExecutionError(format!("monitor size: {e}")))?,
        height: monitor
            .height()
            .map_err(|e| AgentError::ExecutionError(format!("monitor size: {e}")))?,
    })
}

fn execute_blocking(
    screen: u32,
    action: &GroundedAction,
    delay: Duration,
) -> Result<ExecutionReceipt> {
    let started = Instant::now();
    let region = monitor_region(screen)?;

    let detail = match action {
        GroundedAction::Click { x, y, button } => {
            let (gx, gy) = to_global(region, *x, *y)?;
            let button = rdev_button(*button);
            send(EventType::MouseMove { x: gx, y: gy }, delay)?;
            send(EventType::ButtonPress(button), delay)?;
            send(EventType::ButtonRelease(button), delay)?;
            format!("clicked at ({gx}, {gy})")
        }
        GroundedAction::DoubleClick { x, y } => {
            let (gx, gy) = to_global(region, *x, *y)?;
            send(EventType::MouseMove { x: gx, y: gy }, delay)?;
            for _ in 0..2 {
                send(EventType::ButtonPress(Button::Left), delay)?;
                send(EventType::ButtonRelease(Button::Left), delay)?;
            }
            format!("double-clicked at ({gx}, {gy})")
        }
        GroundedAction::Drag { path } => {
            let (first, rest) = path.split_first().ok_or_else(|| {
                AgentError::ExecutionError("drag requires at least one point".to_string())
            })?;
            let (gx, gy) = to_global(region, first.x, first.y)?;
            send(EventType::MouseMove { x: gx, y: gy }, delay)?;
            send(EventType::ButtonPress(Button::Left), delay)?;
            for Point { x, y } in rest {
                let (gx, gy) = to_global(region, *x, *y)?;
                send(EventType::MouseMove { x: gx, y: gy }, delay)?;
            }
            send(EventType::ButtonRelease(Button::Left), delay)?;
            format!("dragged through {} points", path.len())
        }
        GroundedAction::Type { text } => {
            for ch in text.chars() {
                let (key, shifted) = key_for_char(ch).ok_or_else(|| {
                    AgentError::ExecutionError(format!("cannot type character {ch:?}"))
                })?;
                tap(key, shifted, delay)?;
            }
            format!("typed {} characters", text.chars().count())
        }
        GroundedAction::Scroll {
            x, y, delta_x, delta_y,
        } => {
            let (gx, gy) = to_global(region, *x, *y)?;
            send(EventType::MouseMove { x: gx, y: gy }, delay)?;
            send(
                EventType::Wheel {
                    delta_x: *delta_x,
                    delta_y: *delta_y,
                },
                delay,
            )?;
            format!("scrolled (dx={delta_x}, dy={delta_y}) at ({gx}, {gy})")
        }
        GroundedAction::Hotkey { keys } => {
            let resolved: Vec<Key> = keys
                .iter()
                .map(|name| {
                    key_from_name(name).ok_or_else(|| {
                        AgentError::ExecutionError(format!("unknown hotkey key {name:?}"))
                    })
                })
                .collect::<Result<_>>()?;
            for key in &resolved {
                send(EventType::KeyPress(*key), delay)?;
            }
            for key in resolved.iter().rev() {
                send(EventType::KeyRelease(*key), delay)?;
            }
            format!("pressed {}", keys.join("+"))
        }
        GroundedAction::Wait { ms } => {
            std::thread::sleep(Duration::from_millis(*ms));
            format!("waited {ms}ms")
        }
    };

    Ok(ExecutionReceipt {
        detail,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Translate capture-relative coordinates to global ones, rejecting targets
/// outside the monitor bounds.
fn to_global(region: MonitorRegion, x: i32, y: i32) -> Result<(f64, f64)> {
    if x < 0 || y < 0 || x as u32 >= region.width || y as u32 >= region.height {
        return Err(AgentError::ExecutionError(format!(
            "target coordinates ({x}, {y}) out of bounds for {}x{} screen",
            region.width, region.height
        )));
    }
    Ok(((region.x + x) as f64, (region.y + y) as f64))
}

fn send(event: EventType, delay: Duration) -> Result<()> {
    simulate(&event)
        .map_err(|_| AgentError::ExecutionError(format!("failed to inject {event:?}")))?;
    std::thread::sleep(delay);
    Ok(())
}

fn tap(key: Key, shifted: bool, delay: Duration) -> Result<()> {
    if shifted {
        send(EventType::KeyPress(Key::ShiftLeft), delay)?;
    }
    send(EventType::KeyPress(key), delay)?;
    send(EventType::KeyRelease(key), delay)?;
    if shifted {
        send(EventType::KeyRelease(Key::ShiftLeft), delay)?;
    }
    Ok(())
}

fn rdev_button(button: MouseButton) -> Button {
    match button {
        MouseButton::Left => Button::Left,
        MouseButton::Right => Button::Right,
        MouseButton::Middle => Button::Middle,
    }
}

/// US-layout mapping from a character to the key (and shift state) that
/// produces it.
fn key_for_char(ch: char) -> Option<(Key, bool)> {
    let unshifted = |k| Some((k, false));
    let shifted = |k| Some((k, true));

    if ch.is_ascii_lowercase() || ch.is_ascii_uppercase() {
        let key = match ch.to_ascii_lowercase() {
            'a' => Key::KeyA,
            'b' => Key::KeyB,
            'c' => Key::KeyC,
            'd' => Key::KeyD,
            'e' => Key::KeyE,
            'f' => Key::KeyF,
            'g' => Key::KeyG,
            'h' => Key::KeyH,
            'i' => Key::KeyI,
            'j' => Key::KeyJ,
            'k' => Key::KeyK,
            'l' => Key::KeyL,
            'm' => Key::KeyM,
            'n' => Key::KeyN,
            'o' => Key::KeyO,
            'p' => Key::KeyP,
            'q' => Key::KeyQ,
            'r' => Key::KeyR,
            's' => Key::KeyS,
            't' => Key::KeyT,
            'u' => Key::KeyU,
            'v' => Key::KeyV,
            'w' => Key::KeyW,
            'x' => Key::KeyX,
            'y' => Key::KeyY,
            'z' => Key::KeyZ,
            _ => unreachable!(),
        };
        return Some((key, ch.is_ascii_uppercase()));
    }

    match ch {
        '0' => unshifted(Key::Num0),
        '1' => unshifted(Key::Num1),
        '2' => unshifted(Key::Num2),
        '3' => unshifted(Key::Num3),
        '4' => unshifted(Key::Num4),
        '5' => unshifted(Key::Num5),
        '6' => unshifted(Key::Num6),
        '7' => unshifted(Key::Num7),
        '8' => unshifted(Key::Num8),
        '9' => unshifted(Key::Num9),
        ')' => shifted(Key::Num0),
        '!' => shifted(Key::Num1),
        '@' => shifted(Key::Num2),
        '#' => shifted(Key::Num3),
        '$' => shifted(Key::Num4),
        '%' => shifted(Key::Num5),
        '^' => shifted(Key::Num6),
        '&' => shifted(Key::Num7),
        '*' => shifted(Key::Num8),
        '(' => shifted(Key::Num9),
        ' ' => unshifted(Key::Space),
        '\n' => unshifted(Key::Return),
        '\t' => unshifted(Key::Tab),
        '-' => unshifted(Key::Minus),
        '_' => shifted(Key::Minus),
        '=' => unshifted(Key::Equal),
        '+' => shifted(Key::Equal),
        '[' => unshifted(Key::LeftBracket),
        '{' => shifted(Key::LeftBracket),
        ']' => unshifted(Key::RightBracket),
        '}' => shifted(Key::RightBracket),
        '\\' => unshifted(Key::BackSlash),
        '|' => shifted(Key::BackSlash),
        ';' => unshifted(Key::SemiColon),
        ':' => shifted(Key::SemiColon),
        '\'' => unshifted(Key::Quote),
        '"' => shifted(Key::Quote),
        ',' => unshifted(Key::Comma),
        '<' => shifted(Key::Comma),
        '.' => unshifted(Key::Dot),
        '>' => shifted(Key::Dot),
        '/' => unshifted(Key::Slash),
        '?' => shifted(Key::Slash),
        '`' => unshifted(Key::BackQuote),
        '~' => shifted(Key::BackQuote),
        _ => None,
    }
}

/// Resolve a hotkey key name ("ctrl", "enter", "f5", single characters)
/// to an rdev key.
fn key_from_name(name: &str) -> Option<Key> {
    let lower = name.trim().to_ascii_lowercase();
    let key = match lower.as_str() {
        "ctrl" | "control" => Key::ControlLeft,
        "alt" | "option" => Key::Alt,
        "shift" => Key::ShiftLeft,
        "win" | "cmd" | "super" | "meta" => Key::MetaLeft,
        "enter" | "return" => Key::Return,
        "esc" | "escape" => Key::Escape,
        "tab" => Key::Tab,
        "space" => Key::Space,
        "backspace" => Key::Backspace,
        "delete" | "del" => Key::Delete,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" => Key::PageUp,
        "pagedown" => Key::PageDown,
        "up" => Key::UpArrow,
        "down" => Key::DownArrow,
        "left" => Key::LeftArrow,
        "right" => Key::RightArrow,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        _ => {
            let mut chars = lower.chars();
            let (ch, rest) = (chars.next()?, chars.next());
            if rest.is_some() {
                return None;
            }
            return key_for_char(ch).map(|(key, _)| key);
        }
    };
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_for_char_letters_and_shift() {
        assert_eq!(key_for_char('a'), Some((Key::KeyA, false)));
        assert_eq!(key_for_char('Z'), Some((Key::KeyZ, true)));
        assert_eq!(key_for_char('7'), Some((Key::Num7, false)));
        assert_eq!(key_for_char('&'), Some((Key::Num7, true)));
        assert_eq!(key_for_char('_'), Some((Key::Minus, true)));
        assert_eq!(key_for_char('\n'), Some((Key::Return, false)));
        assert_eq!(key_for_char('é'), None);
    }

    #[test]
    fn test_key_from_name() {
        assert_eq!(key_from_name("ctrl"), Some(Key::ControlLeft));
        assert_eq!(key_from_name("Enter"), Some(Key::Return));
        assert_eq!(key_from_name("f5"), Some(Key::F5));
        assert_eq!(key_from_name("s"), Some(Key::KeyS));
        assert_eq!(key_from_name("bogus"), None);
    }

    #[test]
    fn test_to_global_offsets_and_bounds() {
        let region = MonitorRegion {
            x: 1920,
            y: 0,
            width: 1280,
            height: 800,
        };
        assert_eq!(to_global(region, 100, 200).unwrap(), (2020.0, 200.0));
        assert!(to_global(region, 1280, 10).is_err());
        assert!(to_global(region, -1, 10).is_err());
    }
}
