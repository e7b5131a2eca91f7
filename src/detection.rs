//! Repeated-action detection over the stream of tool calls.
//!
//! Pointer jitter and trivially rephrased commands must not hide a loop, so
//! calls are normalized before comparison: coordinates snap to a grid and
//! free-text arguments are truncated.

use std::collections::VecDeque;

use serde_json::{Map, Value};

use crate::models::message::ToolCallSegment;

const HISTORY_CAPACITY: usize = 10;
const DEFAULT_REPEAT_THRESHOLD: usize = 3;
const COORDINATE_GRID: f64 = 10.0;
const TEXT_LIMIT: usize = 50;
const COMMAND_LIMIT: usize = 100;
const SIGNATURE_LIMIT: usize = 200;

/// Canonical signature of a tool call for loop comparison. Two calls with the
/// same signature are considered the same action.
pub fn normalize_tool_call(call: &ToolCallSegment) -> String {
    let mut normalized = Map::new();
    for (key, value) in &call.arguments {
        let value = match (key.as_str(), value) {
            ("coordinate", Value::Array(items)) => Value::Array(
                items
                    .iter()
                    .map(|item| match item.as_f64() {
                        Some(n) => Value::from((n / COORDINATE_GRID).round() * COORDINATE_GRID),
                        None => item.clone(),
                    })
                    .collect(),
            ),
            ("text", Value::String(text)) => Value::String(truncate(text, TEXT_LIMIT)),
            ("command", Value::String(command)) => Value::String(truncate(command, COMMAND_LIMIT)),
            _ => value.clone(),
        };
        normalized.insert(key.clone(), value);
    }
    let arguments =
        serde_json::to_string(&Value::Object(normalized)).unwrap_or_else(|_| "{}".to_string());
    format!("{}:{}", call.tool_name, truncate(&arguments, SIGNATURE_LIMIT))
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// The pattern that tripped detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopSignal {
    /// The same action repeated `count` times in a row.
    ConsecutiveRepeat { signature: String, count: usize },
    /// Two actions strictly alternating over the recent history.
    Alternating { first: String, second: String },
}

/// What to do when a loop is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    Terminate,
}

/// Host-injectable response to a detected loop.
pub trait LoopPolicy: Send + Sync {
    fn on_loop(&self, signal: &LoopSignal) -> LoopAction;
}

/// Default policy: record the observation and keep going.
pub struct ObserveOnly;

impl LoopPolicy for ObserveOnly {
    fn on_loop(&self, _signal: &LoopSignal) -> LoopAction {
        LoopAction::Continue
    }
}

/// Sliding window of recent tool-call signatures with two detectors: N
/// identical calls in a row, and a strict A-B alternation across the last six.
pub struct LoopTracker {
    history: VecDeque<String>,
    repeat_threshold: usize,
}

impl Default for LoopTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopTracker {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_REPEAT_THRESHOLD)
    }

    pub fn with_threshold(repeat_threshold: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            repeat_threshold: repeat_threshold.max(2),
        }
    }

    /// Record one tool call; returns the signal when the window now shows a
    /// loop.
    pub fn record(&mut self, call: &ToolCallSegment) -> Option<LoopSignal> {
        let signature = normalize_tool_call(call);
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(signature);
        self.detect_consecutive().or_else(|| self.detect_alternating())
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    fn detect_consecutive(&self) -> Option<LoopSignal> {
        if self.history.len() < self.repeat_threshold {
            return None;
        }
        let tail: Vec<&String> = self
            .history
            .iter()
            .rev()
            .take(self.repeat_threshold)
            .collect();
        let latest = tail[0];
        if tail.iter().all(|signature| *signature == latest) {
            Some(LoopSignal::ConsecutiveRepeat {
                signature: latest.clone(),
                count: self.repeat_threshold,
            })
        } else {
            None
        }
    }

    fn detect_alternating(&self) -> Option<LoopSignal> {
        if self.history.len() < 6 {
            return None;
        }
        let tail: Vec<&String> = self.history.iter().rev().take(6).collect();
        let (a, b) = (tail[0], tail[1]);
        if a == b {
            return None;
        }
        let alternates = tail
            .iter()
            .enumerate()
            .all(|(i, signature)| *signature == if i % 2 == 0 { a } else { b });
        if alternates {
            Some(LoopSignal::Alternating {
                first: b.clone(),
                second: a.clone(),
            })
        } else {
            None
        }
    }
}
