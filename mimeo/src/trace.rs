//! Loading and validation of recorded demonstration traces.
//!
//! A trace is the stable on-disk contract with the (external) trace
//! authoring pipeline: an ordered list of annotated steps describing what
//! the demonstrator saw and did. Traces are read-only inputs to grounding;
//! nothing in this module mutates them after load.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{AgentError, Result};

/// One abstract step of a demonstration.
///
/// All fields besides `step_idx` are free text written over the recording;
/// none of them carry concrete coordinates. Missing fields are a load-time
/// error, never defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub step_idx: u32,
    /// What the screen showed when the step was recorded.
    pub observation: String,
    /// The demonstrator's rationale for the step.
    pub think: String,
    /// The action taken, described symbolically ("click the red X").
    pub action: String,
    /// The post-condition the demonstrator expected after acting.
    pub expectation: String,
}

/// An immutable, validated demonstration trace.
#[derive(Debug, Clone)]
pub struct Trace {
    pub trace_id: String,
    steps: Vec<TraceStep>,
}

impl Trace {
    /// Build a trace from raw steps, enforcing the index invariant:
    /// contiguous, strictly increasing, starting at 1.
    pub fn new(trace_id: impl Into<String>, steps: Vec<TraceStep>) -> Result<Self> {
        for (i, step) in steps.iter().enumerate() {
            let expected = (i + 1) as u32;
            if step.step_idx != expected {
                return Err(AgentError::TraceMalformed(format!(
                    "step indices must be contiguous from 1: expected {expected}, found {} at position {i}",
                    step.step_idx
                )));
            }
        }
        Ok(Self {
            trace_id: trace_id.into(),
            steps,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }

    /// The step immediately following `after_idx`, or `None` once the trace
    /// is exhausted. `after_idx = 0` yields the first step.
    pub fn next_step(&self, after_idx: u32) -> Option<&TraceStep> {
        self.steps.get(after_idx as usize)
    }

    /// Render the in-context step listing sent to the grounding service,
    /// one `Step [i]: <action>` line per step.
    pub fn guidance(&self) -> String {
        self.steps
            .iter()
            .map(|s| format!("Step [{}]: {}", s.step_idx, s.action))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Deserialize)]
struct TraceFile {
    #[serde(default)]
    #[allow(dead_code)]
    trace_id: Option<String>,
    trajectory: Vec<serde_json::Value>,
}

/// Read-only lookup of traces by identifier under a base directory.
///
/// Layout matches the authoring tool's output: either `<base>/<id>.json`
/// or `<base>/<id>/trace.json`, whichever exists first.
#[derive(Debug, Clone)]
pub struct TraceStore {
    base_dir: PathBuf,
}

impl TraceStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn load(&self, trace_id: &str) -> Result<Trace> {
        let candidates = [
            self.base_dir.join(format!("{trace_id}.json")),
            self.base_dir.join(trace_id).join("trace.json"),
        ];

        let path = candidates
            .iter()
            .find(|p| p.is_file())
            .ok_or_else(|| AgentError::TraceNotFound(trace_id.to_string()))?;

        debug!(trace_id, path = %path.display(), "loading trace");

        let raw = std::fs::read_to_string(path).map_err(|e| {
            AgentError::TraceNotFound(format!("{trace_id}: failed to read {}: {e}", path.display()))
        })?;

        let file: TraceFile = serde_json::from_str(&raw)
            .map_err(|e| AgentError::TraceMalformed(format!("{trace_id}: {e}")))?;

        let mut steps = Vec::new();
        for (i, entry) in file.trajectory.into_iter().enumerate() {
            // Milestone markers are authoring-tool annotations, not steps.
            if entry.get("milestone").is_some() {
                continue;
            }
            let step: TraceStep = serde_json::from_value(entry).map_err(|e| {
                AgentError::TraceMalformed(format!("{trace_id}: trajectory entry {i}: {e}"))
            })?;
            steps.push(step);
        }

        Trace::new(trace_id, steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn step(idx: u32, action: &str) -> TraceStep {
        TraceStep {
            step_idx: idx,
            observation: format!("screen before step {idx}"),
            think: "rationale".to_string(),
            action: action.to_string(),
            expectation: format!("screen after step {idx}"),
        }
    }

    fn write_trace(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_next_step_yields_strictly_increasing_indices() {
        let trace = Trace::new(
            "t",
            vec![step(1, "click it"), step(2, "type hello"), step(3, "press enter")],
        )
        .unwrap();

        let mut after = 0;
        let mut seen = Vec::new();
        while let Some(s) = trace.next_step(after) {
            seen.push(s.step_idx);
            after = s.step_idx;
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(trace.next_step(3).is_none());
        assert!(trace.next_step(99).is_none());
    }

    #[test]
    fn test_empty_trace_is_valid_and_exhausted() {
        let trace = Trace::new("t", vec![]).unwrap();
        assert!(trace.is_empty());
        assert!(trace.next_step(0).is_none());
    }

    #[test]
    fn test_non_contiguous_indices_rejected() {
        let err = Trace::new("t", vec![step(1, "a"), step(3, "b")]).unwrap_err();
        assert!(matches!(err, AgentError::TraceMalformed(_)));

        let err = Trace::new("t", vec![step(2, "a")]).unwrap_err();
        assert!(matches!(err, AgentError::TraceMalformed(_)));

        let err = Trace::new("t", vec![step(1, "a"), step(1, "b")]).unwrap_err();
        assert!(matches!(err, AgentError::TraceMalformed(_)));
    }

    #[test]
    fn test_load_flat_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(
            dir.path(),
            "demo.json",
            r#"{"trajectory": [
                {"step_idx": 1, "observation": "a red X over a code line", "think": "close it", "action": "click it", "expectation": "the X is gone"},
                {"step_idx": 2, "observation": "dashed path below", "think": "trace it", "action": "drag along it", "expectation": "path highlighted"}
            ]}"#,
        );

        let store = TraceStore::new(dir.path());
        let trace = store.load("demo").unwrap();
        assert_eq!(trace.trace_id, "demo");
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.next_step(0).unwrap().action, "click it");
        assert_eq!(
            trace.guidance(),
            "Step [1]: click it\nStep [2]: drag along it"
        );
    }

    #[test]
    fn test_load_nested_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("demo")).unwrap();
        write_trace(
            &dir.path().join("demo"),
            "trace.json",
            r#"{"trace_id": "demo", "trajectory": [
                {"step_idx": 1, "observation": "o", "think": "t", "action": "a", "expectation": "e"}
            ]}"#,
        );

        let trace = TraceStore::new(dir.path()).load("demo").unwrap();
        assert_eq!(trace.len(), 1);
    }

    #[test]
    fn test_milestone_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(
            dir.path(),
            "demo.json",
            r#"{"trajectory": [
                {"step_idx": 1, "observation": "o", "think": "t", "action": "open the menu", "expectation": "e"},
                {"milestone": "menu is open"},
                {"step_idx": 2, "observation": "o", "think": "t", "action": "pick the item", "expectation": "e"}
            ]}"#,
        );

        let trace = TraceStore::new(dir.path()).load("demo").unwrap();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.next_step(1).unwrap().action, "pick the item");
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(
            dir.path(),
            "demo.json",
            r#"{"trajectory": [
                {"step_idx": 1, "observation": "o", "action": "a", "expectation": "e"}
            ]}"#,
        );

        let err = TraceStore::new(dir.path()).load("demo").unwrap_err();
        assert!(matches!(err, AgentError::TraceMalformed(_)));
    }

    #[test]
    fn test_unknown_trace_id() {
        let dir = tempfile::tempdir().unwrap();
        let err = TraceStore::new(dir.path()).load("nope").unwrap_err();
        assert!(matches!(err, AgentError::TraceNotFound(_)));
    }
}
