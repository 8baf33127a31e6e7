//! Progress events.
//!
//! Every state change the outside world cares about becomes a
//! [`ProgressEvent`] with a strictly increasing sequence number. Events go
//! to live subscribers over a broadcast channel and into a bounded ring
//! buffer, so a late subscriber first replays recent history and then
//! follows the live stream without gaps or duplicates.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use super::state::WorkflowState;

/// Kind of progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    TaskStarted,
    TaskSucceeded,
    TaskFailed,
    TaskBlocked,
    TaskSplit,
    TaskAborted,
    EscalationApplied,
    CascadeDetected,
    CheckpointSaved,
    WorkflowTerminal,
}

impl EventType {
    /// Get the canonical label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::TaskStarted => "task_started",
            Self::TaskSucceeded => "task_succeeded",
            Self::TaskFailed => "task_failed",
            Self::TaskBlocked => "task_blocked",
            Self::TaskSplit => "task_split",
            Self::TaskAborted => "task_aborted",
            Self::EscalationApplied => "escalation_applied",
            Self::CascadeDetected => "cascade_detected",
            Self::CheckpointSaved => "checkpoint_saved",
            Self::WorkflowTerminal => "workflow_terminal",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Position in the workflow's event stream
    pub sequence_number: u64,

    /// What happened
    pub event_type: EventType,

    /// When it happened
    pub timestamp: DateTime<Utc>,

    /// Event details
    pub payload: serde_json::Value,
}

impl ProgressEvent {
    /// One-line description for terminal output.
    pub fn summary(&self) -> String {
        let field = |name| self.field(name);
        match self.event_type {
            EventType::TaskStarted => format!(
                "{} started on {} ({}, attempt {})",
                field("task_id"),
                field("worker_id"),
                field("requirement_id"),
                self.payload.get("attempt").and_then(serde_json::Value::as_u64).unwrap_or(0)
            ),
            EventType::TaskSucceeded => format!("{} succeeded", field("task_id")),
            EventType::TaskFailed => format!("{} failed: {}", field("task_id"), field("error")),
            EventType::TaskBlocked => format!("{} blocked: {}", field("task_id"), field("reason")),
            EventType::TaskSplit => {
                format!("{} split, continuing as {}", field("task_id"), field("continuation_id"))
            }
            EventType::TaskAborted => format!("{} aborted", field("task_id")),
            EventType::EscalationApplied => {
                format!("{} escalated: {}", field("task_id"), field("strategy"))
            }
            EventType::CascadeDetected => "failure cascade detected, admission paused".to_string(),
            EventType::CheckpointSaved => format!("checkpoint saved to {}", field("path")),
            EventType::WorkflowStarted => format!("workflow {} started", field("workflow_id")),
            EventType::WorkflowTerminal => format!("workflow finished: {}", field("overall_status")),
        }
    }
}

impl ProgressEvent {
    fn field(&self, name: &str) -> &str {
        self.payload.get(name).and_then(serde_json::Value::as_str).unwrap_or("")
    }
}

struct Ring {
    events: VecDeque<ProgressEvent>,
    capacity: usize,
}

impl Ring {
    fn push(&mut self, event: ProgressEvent) {
        while self.events.len() >= self.capacity.max(1) {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Fans progress events out to subscribers.
#[derive(Clone)]
pub struct ProgressPublisher {
    ring: Arc<Mutex<Ring>>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl fmt::Debug for ProgressPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressPublisher")
            .field("buffered", &self.ring.lock().events.len())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl ProgressPublisher {
    /// Create a publisher keeping the last `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            ring: Arc::new(Mutex::new(Ring { events: VecDeque::with_capacity(capacity), capacity })),
            sender,
        }
    }

    /// Assign the next sequence number and publish.
    ///
    /// Called with the state lock held, so numbering follows the order of
    /// state changes.
    pub fn emit(
        &self,
        state: &mut WorkflowState,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> ProgressEvent {
        state.sequence_number += 1;
        let event = ProgressEvent {
            sequence_number: state.sequence_number,
            event_type,
            timestamp: Utc::now(),
            payload,
        };
        self.publish(event.clone());
        event
    }

    /// Publish an event that already carries its sequence number.
    pub fn publish(&self, event: ProgressEvent) {
        tracing::trace!(seq = event.sequence_number, event = %event.event_type, "Progress event");
        let mut ring = self.ring.lock();
        ring.push(event.clone());
        // No receivers is not an error
        let _ = self.sender.send(event);
    }

    /// Subscribe: replay buffered events, then follow the live stream.
    pub fn subscribe(&self) -> EventSubscription {
        let ring = self.ring.lock();
        let backlog: VecDeque<ProgressEvent> = ring.events.iter().cloned().collect();
        let receiver = self.sender.subscribe();
        drop(ring);
        EventSubscription { backlog, receiver, last_seen: 0 }
    }

    /// Buffered events, oldest first.
    pub fn history(&self) -> Vec<ProgressEvent> {
        self.ring.lock().events.iter().cloned().collect()
    }

    /// Buffered events with a sequence number above `sequence`.
    pub fn since(&self, sequence: u64) -> Vec<ProgressEvent> {
        self.ring.lock().events.iter().filter(|e| e.sequence_number > sequence).cloned().collect()
    }

    /// Replace the buffer, e.g. with events loaded from a checkpoint.
    pub fn restore(&self, events: Vec<ProgressEvent>) {
        let mut ring = self.ring.lock();
        ring.events.clear();
        for event in events {
            ring.push(event);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A subscriber's view of the event stream.
pub struct EventSubscription {
    backlog: VecDeque<ProgressEvent>,
    receiver: broadcast::Receiver<ProgressEvent>,
    last_seen: u64,
}

impl EventSubscription {
    fn accept(&mut self, event: ProgressEvent) -> Option<ProgressEvent> {
        if event.sequence_number > self.last_seen {
            self.last_seen = event.sequence_number;
            Some(event)
        } else {
            None
        }
    }

    /// Wait for the next event. Returns `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        while let Some(event) = self.backlog.pop_front() {
            if let Some(event) = self.accept(event) {
                return Some(event);
            }
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is available right now.
    pub fn try_next(&mut self) -> Option<ProgressEvent> {
        while let Some(event) = self.backlog.pop_front() {
            if let Some(event) = self.accept(event) {
                return Some(event);
            }
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Sequence number of the last event handed out.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }
}
