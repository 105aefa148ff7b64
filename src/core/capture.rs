//! Capture session state machine.
//!
//! Sessions are keyed by group. Local calls only ever move a session to
//! `Requested`; every later transition is driven by backend `captureUpdate`
//! events through [`transition`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

use crate::transport::{Command, EventSink};

/// A declared phase of a capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturePhase {
    #[serde(alias = "phase_id", alias = "id")]
    pub phase_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "start_time", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, alias = "end_time", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

/// Payload of a `captureUpdate` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureUpdate {
    #[serde(default, alias = "group_id")]
    pub group_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "current_phase_id")]
    pub current_phase_id: Option<String>,
    #[serde(default)]
    pub phases: Vec<CapturePhase>,
    #[serde(default, alias = "stop_time")]
    pub stop_time: Option<i64>,
}

impl CaptureUpdate {
    pub fn is_cancelled(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.trim().eq_ignore_ascii_case("cancelled") || s.trim().eq_ignore_ascii_case("canceled"))
            .unwrap_or(false)
    }
}

/// Where a capture session is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureStatus {
    Idle,
    Requested,
    Active { phase_id: String },
    Stopped,
    Cancelled,
}

impl CaptureStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaptureStatus::Stopped | CaptureStatus::Cancelled)
    }

    /// A session is in flight (Requested or Active).
    pub fn is_open(&self) -> bool {
        matches!(self, CaptureStatus::Requested | CaptureStatus::Active { .. })
    }
}

/// Outcome of feeding one status event to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Changed(CaptureStatus),
    Unchanged,
    /// Event arrived for a session that is not in flight.
    Ignored,
}

/// Pure transition function.
///
/// `declared` is the phase list known for the session; phases carried on the
/// event itself take precedence.
pub fn transition(current: &CaptureStatus, update: &CaptureUpdate, declared: &[CapturePhase]) -> Transition {
    if !current.is_open() {
        return Transition::Ignored;
    }

    let next = if update.is_cancelled() {
        CaptureStatus::Cancelled
    } else if update.stop_time.is_some() {
        CaptureStatus::Stopped
    } else {
        let phases = if update.phases.is_empty() {
            declared
        } else {
            &update.phases[..]
        };
        match update
            .current_phase_id
            .as_deref()
            .filter(|id| phases.iter().any(|p| p.phase_id == *id))
        {
            Some(id) => CaptureStatus::Active {
                phase_id: id.to_string(),
            },
            None => return Transition::Unchanged,
        }
    };

    if &next == current {
        Transition::Unchanged
    } else {
        Transition::Changed(next)
    }
}

/// Error returned by local capture requests.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureError {
    AlreadyActive { group_id: String },
    NotActive { group_id: String },
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::AlreadyActive { group_id } => {
                write!(f, "A capture is already in progress for group {}", group_id)
            }
            CaptureError::NotActive { group_id } => {
                write!(f, "No capture in progress for group {}", group_id)
            }
        }
    }
}

impl std::error::Error for CaptureError {}

/// Parameters of a start request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureRequest {
    pub capture_type: String,
    pub capture_name: Option<String>,
    pub tags: BTreeSet<String>,
    /// Phases known up front; may be replaced by the backend's list
    pub phases: Vec<CapturePhase>,
}

/// One capture session.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSession {
    /// Local identifier for log correlation
    pub local_id: Uuid,
    pub group_id: String,
    pub capture_type: String,
    pub capture_name: Option<String>,
    pub tags: BTreeSet<String>,
    pub status: CaptureStatus,
    pub current_phase_id: Option<String>,
    pub phases: Vec<CapturePhase>,
    pub requested_at: DateTime<Utc>,
}

/// Reported after a status event changed a session.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureTransition {
    pub group_id: String,
    pub capture_type: String,
    pub from: CaptureStatus,
    pub to: CaptureStatus,
    /// Whether a follow-up refresh was emitted
    pub follow_up: bool,
}

/// Per-group capture bookkeeping.
#[derive(Debug, Clone)]
pub struct CaptureController {
    sessions: HashMap<String, CaptureSession>,
    follow_up_types: Vec<String>,
    stale_events: u64,
}

impl CaptureController {
    /// `follow_up_types` lists capture types that need a data refresh once
    /// stopped (matched case-insensitively).
    pub fn new(follow_up_types: Vec<String>) -> Self {
        Self {
            sessions: HashMap::new(),
            follow_up_types: follow_up_types
                .into_iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            stale_events: 0,
        }
    }

    pub fn status(&self, group_id: &str) -> CaptureStatus {
        self.sessions
            .get(group_id)
            .map(|s| s.status.clone())
            .unwrap_or(CaptureStatus::Idle)
    }

    pub fn session(&self, group_id: &str) -> Option<&CaptureSession> {
        self.sessions.get(group_id)
    }

    pub fn is_recording(&self, group_id: &str) -> bool {
        matches!(self.status(group_id), CaptureStatus::Active { .. })
    }

    /// Status events ignored because no session was in flight.
    pub fn stale_events(&self) -> u64 {
        self.stale_events
    }

    /// Request a new capture. Allowed from Idle or a terminal state.
    pub fn start_capture(
        &mut self,
        group_id: &str,
        request: CaptureRequest,
        sink: &dyn EventSink,
    ) -> Result<Uuid, CaptureError> {
        if self.status(group_id).is_open() {
            return Err(CaptureError::AlreadyActive {
                group_id: group_id.to_string(),
            });
        }

        let session = CaptureSession {
            local_id: Uuid::new_v4(),
            group_id: group_id.to_string(),
            capture_type: request.capture_type,
            capture_name: request.capture_name,
            tags: request.tags,
            status: CaptureStatus::Requested,
            current_phase_id: None,
            phases: request.phases,
            requested_at: Utc::now(),
        };

        sink.emit(Command::StartCapture {
            group_id: session.group_id.clone(),
            capture_type: session.capture_type.clone(),
            capture_name: session.capture_name.clone(),
            tags: session.tags.iter().cloned().collect(),
        });
        info!(
            "Capture requested for group {} (type {}, id {})",
            group_id, session.capture_type, session.local_id
        );

        let local_id = session.local_id;
        self.sessions.insert(group_id.to_string(), session);
        Ok(local_id)
    }

    /// Ask the backend to stop. Local state is left untouched; the stop is
    /// confirmed by a later status event.
    pub fn stop_capture(&mut self, group_id: &str, sink: &dyn EventSink) -> Result<(), CaptureError> {
        if !self.status(group_id).is_open() {
            return Err(CaptureError::NotActive {
                group_id: group_id.to_string(),
            });
        }
        sink.emit(Command::StopCapture {
            group_id: group_id.to_string(),
        });
        debug!("Stop requested for group {}", group_id);
        Ok(())
    }

    /// Apply a backend status event.
    pub fn on_update(&mut self, update: &CaptureUpdate, sink: &dyn EventSink) -> Option<CaptureTransition> {
        let Some(session) = self.sessions.get_mut(&update.group_id) else {
            self.stale_events += 1;
            debug!("Ignoring captureUpdate for untracked group {:?}", update.group_id);
            return None;
        };

        match transition(&session.status, update, &session.phases) {
            Transition::Ignored => {
                self.stale_events += 1;
                debug!(
                    "Ignoring captureUpdate for group {} in state {:?}",
                    update.group_id, session.status
                );
                None
            }
            Transition::Unchanged => None,
            Transition::Changed(next) => {
                if !update.phases.is_empty() {
                    session.phases = update.phases.clone();
                }
                if let CaptureStatus::Active { phase_id } = &next {
                    session.current_phase_id = Some(phase_id.clone());
                }

                let from = std::mem::replace(&mut session.status, next.clone());
                let follow_up = next == CaptureStatus::Stopped
                    && self
                        .follow_up_types
                        .contains(&session.capture_type.trim().to_lowercase());
                if follow_up {
                    sink.emit(Command::GetGroups);
                }

                info!(
                    "Capture for group {}: {:?} -> {:?}",
                    session.group_id, from, next
                );
                Some(CaptureTransition {
                    group_id: session.group_id.clone(),
                    capture_type: session.capture_type.clone(),
                    from,
                    to: next,
                    follow_up,
                })
            }
        }
    }

    /// Forget the session of a removed group.
    pub fn remove_group(&mut self, group_id: &str) -> bool {
        self.sessions.remove(group_id).is_some()
    }
}

impl Default for CaptureController {
    fn default() -> Self {
        Self::new(vec!["weight".to_string()])
    }
}
