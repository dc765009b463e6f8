//! Session lifecycle: the single authority for create, arm, start, stop and archive.
//!
//! The manager owns the current [`Session`] record and persists it through the
//! [`SessionStore`] after every mutation. A failed write is fatal to the session: it is moved
//! to `aborted` and the error is returned to the caller.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::ClockSync;
use crate::config::CoordinatorConfig;
use crate::protocol::{Command, RecordingParameters};
use crate::registry::{Capability, ConnectionState, DeviceRegistry, Role};
use crate::store::{SessionStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Configuring,
    Armed,
    Recording,
    Stopping,
    Aggregating,
    Archived,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Archived | SessionState::Aborted)
    }

    /// Forward-only lifecycle; `aborted` is reachable from any live state.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, Aborted) => !from.is_terminal() && from != Idle,
            (Idle, Configuring)
            | (Configuring, Armed)
            | (Armed, Recording)
            | (Recording, Stopping)
            | (Stopping, Aggregating)
            | (Aggregating, Archived) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Configuring => "configuring",
            SessionState::Armed => "armed",
            SessionState::Recording => "recording",
            SessionState::Stopping => "stopping",
            SessionState::Aggregating => "aggregating",
            SessionState::Archived => "archived",
            SessionState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Interval during which a member's channel was down while recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub from: i64,
    pub to: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationOutcome {
    NotStarted,
    Pending,
    Complete,
    Failed,
}

/// Membership snapshot. Frozen once recording: members are flagged, never removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMember {
    pub device_id: String,
    pub role: Option<Role>,
    pub capabilities: BTreeSet<Capability>,
    pub degraded: bool,
    pub disconnected: bool,
    /// Sync was lost at some point during the recording; data is unaligned.
    pub unsynchronised: bool,
    pub start_acknowledged: bool,
    pub stop_acknowledged: bool,
    pub aggregation: AggregationOutcome,
    /// Start time as sent to the node, in the node's own clock.
    pub scheduled_start_local: Option<i64>,
    pub gaps: Vec<Gap>,
}

impl SessionMember {
    fn new(device_id: &str, role: Option<Role>, capabilities: BTreeSet<Capability>) -> Self {
        Self {
            device_id: device_id.to_string(),
            role,
            capabilities,
            degraded: false,
            disconnected: false,
            unsynchronised: false,
            start_acknowledged: false,
            stop_acknowledged: false,
            aggregation: AggregationOutcome::NotStarted,
            scheduled_start_local: None,
            gaps: Vec::new(),
        }
    }

    fn close_gap(&mut self, now: i64) {
        if let Some(gap) = self.gaps.last_mut() {
            if gap.to.is_none() {
                gap.to = Some(now);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Complete,
    Incomplete,
}

/// Manifest entry for one aggregated file. `size_bytes` is what was written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub device_id: String,
    pub name: String,
    /// Relative to the session directory.
    pub path: PathBuf,
    pub size_bytes: u64,
    pub declared_size: u64,
    pub checksum: String,
    pub status: FileStatus,
    pub committed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimulusEvent {
    /// Milliseconds since the session start time.
    pub timestamp_ms: i64,
    pub label: String,
    /// `operator` or the id of the node that sent it.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: SessionState,
    pub at: i64,
}

/// Persisted metadata record, written to `<data_dir>/<session_id>/session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub label: String,
    pub created_at: i64,
    pub state: SessionState,
    /// Scheduled start in coordinator time.
    pub start_time: Option<i64>,
    /// Set once, by stop.
    pub end_time: Option<i64>,
    pub members: Vec<SessionMember>,
    /// Nodes dropped from the snapshot because they never acknowledged the start.
    pub excluded: Vec<String>,
    pub files: Vec<FileRecord>,
    pub events: Vec<StimulusEvent>,
    pub incomplete: bool,
    pub abort_reason: Option<String>,
    pub history: Vec<StateChange>,
}

impl Session {
    /// New session in `configuring`.
    pub fn new(label: &str, now: i64) -> Self {
        Self {
            session_id: new_session_id(now),
            label: label.to_string(),
            created_at: now,
            state: SessionState::Configuring,
            start_time: None,
            end_time: None,
            members: Vec::new(),
            excluded: Vec::new(),
            files: Vec::new(),
            events: Vec::new(),
            incomplete: false,
            abort_reason: None,
            history: vec![StateChange {
                state: SessionState::Configuring,
                at: now,
            }],
        }
    }

    pub fn member(&self, device_id: &str) -> Option<&SessionMember> {
        self.members.iter().find(|m| m.device_id == device_id)
    }

    fn member_mut(&mut self, device_id: &str) -> Option<&mut SessionMember> {
        self.members.iter_mut().find(|m| m.device_id == device_id)
    }

    pub fn is_member(&self, device_id: &str) -> bool {
        self.member(device_id).is_some()
    }
}

/// `session_YYYYmmdd_HHMMSS_<8 hex>`: sortable by creation and unique across coordinators.
fn new_session_id(now: i64) -> String {
    let stamp = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(now)
        .map(|t| t.format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_else(|| now.to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("session_{stamp}_{}", &suffix[..8])
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no session")]
    NoSession,
    #[error("session {0} is still active")]
    SessionActive(String),
    #[error("cannot {op} while {state}")]
    WrongState { op: &'static str, state: SessionState },
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
    #[error("session has no members")]
    NoMembers,
    #[error("{0} is not a session member")]
    NotMember(String),
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error("nodes not ready: {}", .0.join(", "))]
    NotReady(Vec<String>),
    #[error("end time already set")]
    EndTimeAlreadySet,
    #[error("metadata persistence failed: {0}")]
    Persist(#[from] StoreError),
}

/// Recorded state change, drained by the coordinator to raise events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub session_id: String,
    pub from: SessionState,
    pub to: SessionState,
    pub at: i64,
}

/// Start commands for every connected member, to be written out back-to-back.
#[derive(Debug, Clone, PartialEq)]
pub struct StartPlan {
    pub session_id: String,
    pub start_time: i64,
    pub commands: Vec<(String, Command)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopPlan {
    pub session_id: String,
    pub end_time: i64,
    pub commands: Vec<(String, Command)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationPlan {
    /// Connected members that never acknowledged the stop; now degraded.
    pub unacked: Vec<String>,
    pub commands: Vec<(String, Command)>,
    /// No member was left to aggregate from.
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartWindowClosed {
    pub excluded: Vec<String>,
    pub aborted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectEffect {
    None,
    Degraded,
    AggregationFailed { archived: bool },
    SessionAborted,
}

pub struct SessionManager {
    store: SessionStore,
    current: Option<Session>,
    start_delay_ms: i64,
    stop_timeout_ms: i64,
    arm_timeout_ms: i64,
    start_window_open: bool,
    stop_deadline: Option<i64>,
    transitions: Vec<Transition>,
}

impl SessionManager {
    pub fn new(store: SessionStore, config: &CoordinatorConfig) -> Self {
        Self {
            store,
            current: None,
            start_delay_ms: config.start_delay_ms,
            stop_timeout_ms: config.stop_timeout_ms,
            arm_timeout_ms: config.arm_timeout_ms,
            start_window_open: false,
            stop_deadline: None,
            transitions: Vec::new(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn session(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.current.as_ref().map_or(SessionState::Idle, |s| s.state)
    }

    pub fn session_dir(&self) -> Option<PathBuf> {
        self.current
            .as_ref()
            .map(|s| self.store.session_dir(&s.session_id))
    }

    pub fn is_member(&self, device_id: &str) -> bool {
        self.current.as_ref().is_some_and(|s| s.is_member(device_id))
    }

    pub fn drain_transitions(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.transitions)
    }

    fn require(&self, op: &'static str, allowed: &[SessionState]) -> Result<(), SessionError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else if state == SessionState::Idle {
            Err(SessionError::NoSession)
        } else {
            Err(SessionError::WrongState { op, state })
        }
    }

    fn current_mut(&mut self) -> Result<&mut Session, SessionError> {
        self.current.as_mut().ok_or(SessionError::NoSession)
    }

    fn transition(&mut self, to: SessionState, now: i64) -> Result<(), SessionError> {
        let session = self.current.as_mut().ok_or(SessionError::NoSession)?;
        let from = session.state;
        if !from.can_transition_to(to) {
            return Err(SessionError::InvalidTransition { from, to });
        }
        session.state = to;
        session.history.push(StateChange { state: to, at: now });
        info!(session_id = %session.session_id, %from, %to, "session transition");
        self.transitions.push(Transition {
            session_id: session.session_id.clone(),
            from,
            to,
            at: now,
        });
        Ok(())
    }

    /// Write the record. On failure a live session is aborted and the abort is written on a
    /// best-effort basis.
    fn persist(&mut self, now: i64) -> Result<(), SessionError> {
        let Some(session) = self.current.as_mut() else {
            return Ok(());
        };
        let err = match self.store.save(session) {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        warn!(session_id = %session.session_id, error = %err, "session metadata write failed");
        if !session.state.is_terminal() {
            let from = session.state;
            session.state = SessionState::Aborted;
            session.incomplete = true;
            session.abort_reason = Some(format!("metadata persistence failed: {err}"));
            session.history.push(StateChange {
                state: SessionState::Aborted,
                at: now,
            });
            self.transitions.push(Transition {
                session_id: session.session_id.clone(),
                from,
                to: SessionState::Aborted,
                at: now,
            });
            self.start_window_open = false;
            self.stop_deadline = None;
            let _ = self.store.save(session);
        }
        Err(err.into())
    }

    /// Flush the current record to disk.
    pub fn flush(&mut self, now: i64) -> Result<(), SessionError> {
        self.persist(now)
    }

    /// idle → configuring. A previous terminal session is replaced.
    pub fn create(&mut self, label: &str, now: i64) -> Result<&Session, SessionError> {
        if let Some(s) = &self.current {
            if !s.state.is_terminal() {
                return Err(SessionError::SessionActive(s.session_id.clone()));
            }
        }
        let session = Session::new(label, now);
        info!(session_id = %session.session_id, label, "session created");
        self.transitions.push(Transition {
            session_id: session.session_id.clone(),
            from: SessionState::Idle,
            to: SessionState::Configuring,
            at: now,
        });
        self.current = Some(session);
        self.start_window_open = false;
        self.stop_deadline = None;
        self.persist(now)?;
        self.current.as_ref().ok_or(SessionError::NoSession)
    }

    /// Add (or refresh) an intended participant from its registry entry.
    pub fn add_member(
        &mut self,
        device_id: &str,
        registry: &DeviceRegistry,
        now: i64,
    ) -> Result<(), SessionError> {
        self.require("add a member", &[SessionState::Configuring])?;
        let node = registry
            .get(device_id)
            .ok_or_else(|| SessionError::UnknownDevice(device_id.to_string()))?;
        if !node.state.is_connected() {
            return Err(SessionError::NotConnected(device_id.to_string()));
        }
        let session = self.current_mut()?;
        match session.member_mut(device_id) {
            Some(m) => {
                m.role = node.role;
                m.capabilities = node.capabilities.clone();
            }
            None => session.members.push(SessionMember::new(
                device_id,
                node.role,
                node.capabilities.clone(),
            )),
        }
        self.persist(now)
    }

    pub fn remove_member(&mut self, device_id: &str, now: i64) -> Result<(), SessionError> {
        self.require("remove a member", &[SessionState::Configuring])?;
        let session = self.current_mut()?;
        let before = session.members.len();
        session.members.retain(|m| m.device_id != device_id);
        if session.members.len() == before {
            return Err(SessionError::NotMember(device_id.to_string()));
        }
        self.persist(now)
    }

    /// configuring → armed: every member registered or active with a valid sync sample.
    pub fn arm(
        &mut self,
        registry: &DeviceRegistry,
        clock: &ClockSync,
        now: i64,
    ) -> Result<(), SessionError> {
        self.require("arm", &[SessionState::Configuring])?;
        let session = self.current_mut()?;
        if session.members.is_empty() {
            return Err(SessionError::NoMembers);
        }
        let not_ready: Vec<String> = session
            .members
            .iter()
            .filter(|m| {
                let linked = registry.get(&m.device_id).is_some_and(|n| {
                    matches!(n.state, ConnectionState::Registered | ConnectionState::Active)
                });
                !(linked && clock.has_valid_sample(&m.device_id))
            })
            .map(|m| m.device_id.clone())
            .collect();
        if !not_ready.is_empty() {
            return Err(SessionError::NotReady(not_ready));
        }
        for m in &mut session.members {
            if let Some(node) = registry.get(&m.device_id) {
                m.role = node.role;
                m.capabilities = node.capabilities.clone();
            }
        }
        self.transition(SessionState::Armed, now)?;
        self.persist(now)
    }

    /// armed → recording. `T_start = now + start_delay`, converted per node into its own clock.
    pub fn start(
        &mut self,
        registry: &DeviceRegistry,
        clock: &ClockSync,
        now: i64,
    ) -> Result<StartPlan, SessionError> {
        self.require("start", &[SessionState::Armed])?;
        let start_time = now + self.start_delay_ms;
        let session = self.current_mut()?;
        session.start_time = Some(start_time);
        let session_id = session.session_id.clone();
        let mut commands = Vec::with_capacity(session.members.len());
        for m in &mut session.members {
            let connected = registry
                .get(&m.device_id)
                .is_some_and(|n| n.state.is_connected());
            if !connected {
                m.disconnected = true;
                continue;
            }
            let local = match clock.to_node_time(&m.device_id, start_time) {
                Some(t) => t,
                None => {
                    m.unsynchronised = true;
                    start_time
                }
            };
            m.scheduled_start_local = Some(local);
            commands.push((m.device_id.clone(), start_command(&session_id, start_time, m)));
        }
        self.start_window_open = true;
        self.transition(SessionState::Recording, now)?;
        self.persist(now)?;
        Ok(StartPlan {
            session_id,
            start_time,
            commands,
        })
    }

    /// A member acknowledged `start_recording`. Closes the window early once every member has.
    pub fn on_start_ack(
        &mut self,
        device_id: &str,
        ok: bool,
        now: i64,
    ) -> Result<Option<StartWindowClosed>, SessionError> {
        if !self.start_window_open || self.state() != SessionState::Recording {
            return Ok(None);
        }
        let session = self.current_mut()?;
        let member = session
            .member_mut(device_id)
            .ok_or_else(|| SessionError::NotMember(device_id.to_string()))?;
        if ok {
            member.start_acknowledged = true;
        } else {
            warn!(device_id, "start_recording refused");
        }
        self.close_start_window(now, false)
    }

    /// Freeze membership: members without a start ack are moved to `excluded`. Happens when
    /// all members acked, at `T_start`, or immediately when `force` is set.
    pub fn close_start_window(
        &mut self,
        now: i64,
        force: bool,
    ) -> Result<Option<StartWindowClosed>, SessionError> {
        if !self.start_window_open {
            return Ok(None);
        }
        let session = match self.current.as_mut() {
            Some(s) if s.state == SessionState::Recording => s,
            _ => {
                self.start_window_open = false;
                return Ok(None);
            }
        };
        let all_acked = session.members.iter().all(|m| m.start_acknowledged);
        let deadline = session.start_time.unwrap_or(now);
        if !all_acked && !force && now < deadline {
            return Ok(None);
        }
        self.start_window_open = false;
        let (kept, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut session.members)
            .into_iter()
            .partition(|m| m.start_acknowledged);
        session.members = kept;
        let excluded: Vec<String> = dropped.into_iter().map(|m| m.device_id).collect();
        session.excluded.extend(excluded.iter().cloned());
        let aborted = session.members.is_empty();
        if aborted {
            self.abort("no node acknowledged start_recording", now)?;
        } else if !excluded.is_empty() {
            warn!(excluded = ?excluded, "nodes excluded from session");
            self.persist(now)?;
        }
        Ok(Some(StartWindowClosed { excluded, aborted }))
    }

    /// A member's channel dropped. While recording it is only flagged; losing every member
    /// aborts the session.
    pub fn on_member_disconnected(
        &mut self,
        device_id: &str,
        now: i64,
    ) -> Result<DisconnectEffect, SessionError> {
        let Some(session) = self.current.as_mut() else {
            return Ok(DisconnectEffect::None);
        };
        let state = session.state;
        let Some(member) = session.member_mut(device_id) else {
            return Ok(DisconnectEffect::None);
        };
        match state {
            SessionState::Recording | SessionState::Stopping => {
                if member.disconnected {
                    return Ok(DisconnectEffect::None);
                }
                member.disconnected = true;
                member.degraded = true;
                member.gaps.push(Gap {
                    from: now,
                    to: None,
                });
                if session.members.iter().all(|m| m.disconnected) {
                    self.abort("all nodes disconnected", now)?;
                    return Ok(DisconnectEffect::SessionAborted);
                }
                self.persist(now)?;
                Ok(DisconnectEffect::Degraded)
            }
            SessionState::Aggregating => {
                member.disconnected = true;
                member.degraded = true;
                if member.aggregation == AggregationOutcome::Pending {
                    member.aggregation = AggregationOutcome::Failed;
                }
                let archived = self.archive_if_done(now)?;
                Ok(DisconnectEffect::AggregationFailed { archived })
            }
            _ => Ok(DisconnectEffect::None),
        }
    }

    /// A member re-registered. Returns the command that brings it back in step with the
    /// session, if any.
    pub fn on_member_reconnected(
        &mut self,
        device_id: &str,
        now: i64,
    ) -> Result<Option<Command>, SessionError> {
        let Some(session) = self.current.as_mut() else {
            return Ok(None);
        };
        let state = session.state;
        let session_id = session.session_id.clone();
        let start_time = session.start_time;
        let Some(member) = session.member_mut(device_id) else {
            return Ok(None);
        };
        if !member.disconnected {
            return Ok(None);
        }
        let command = match state {
            SessionState::Recording => {
                member.close_gap(now);
                start_time.map(|t| start_command(&session_id, t, member))
            }
            SessionState::Stopping => {
                member.close_gap(now);
                (!member.stop_acknowledged).then(|| Command::StopRecording {
                    session_id: session_id.clone(),
                })
            }
            SessionState::Aggregating => {
                member.aggregation = AggregationOutcome::Pending;
                Some(Command::SendFiles {
                    session_id: session_id.clone(),
                })
            }
            _ => return Ok(None),
        };
        member.disconnected = false;
        info!(device_id, %state, "member rejoined session");
        self.persist(now)?;
        Ok(command)
    }

    /// Sync quality of a member fell to zero during the recording.
    pub fn mark_unsynchronised(&mut self, device_id: &str, now: i64) -> Result<bool, SessionError> {
        if !matches!(
            self.state(),
            SessionState::Recording | SessionState::Stopping
        ) {
            return Ok(false);
        }
        let session = self.current_mut()?;
        let Some(member) = session.member_mut(device_id) else {
            return Ok(false);
        };
        if member.unsynchronised {
            return Ok(false);
        }
        member.unsynchronised = true;
        member.degraded = true;
        self.persist(now)?;
        Ok(true)
    }

    /// Append a stimulus event stamped at coordinator time `at`. Timestamps in the log never
    /// decrease: a late arrival is stamped no earlier than the last entry.
    pub fn add_event(
        &mut self,
        label: &str,
        source: &str,
        at: i64,
        now: i64,
    ) -> Result<StimulusEvent, SessionError> {
        self.require("record an event", &[SessionState::Recording])?;
        let session = self.current_mut()?;
        let relative = at.saturating_sub(session.start_time.unwrap_or(at));
        let timestamp_ms = session
            .events
            .last()
            .map_or(relative, |last| last.timestamp_ms.max(relative));
        let event = StimulusEvent {
            timestamp_ms,
            label: label.to_string(),
            source: source.to_string(),
        };
        session.events.push(event.clone());
        self.persist(now)?;
        Ok(event)
    }

    /// recording → stopping. Sets the end time and returns the stop broadcast.
    pub fn stop(&mut self, now: i64) -> Result<StopPlan, SessionError> {
        self.require("stop", &[SessionState::Recording])?;
        let stop_timeout = self.stop_timeout_ms;
        let session = self.current_mut()?;
        if session.end_time.is_some() {
            return Err(SessionError::EndTimeAlreadySet);
        }
        session.end_time = Some(now);
        let session_id = session.session_id.clone();
        let commands: Vec<(String, Command)> = session
            .members
            .iter()
            .filter(|m| !m.disconnected)
            .map(|m| {
                (
                    m.device_id.clone(),
                    Command::StopRecording {
                        session_id: session_id.clone(),
                    },
                )
            })
            .collect();
        self.stop_deadline = Some(now + stop_timeout);
        self.transition(SessionState::Stopping, now)?;
        self.persist(now)?;
        Ok(StopPlan {
            session_id,
            end_time: now,
            commands,
        })
    }

    pub fn on_stop_ack(
        &mut self,
        device_id: &str,
        now: i64,
    ) -> Result<Option<AggregationPlan>, SessionError> {
        if self.state() != SessionState::Stopping {
            return Ok(None);
        }
        let session = self.current_mut()?;
        let member = session
            .member_mut(device_id)
            .ok_or_else(|| SessionError::NotMember(device_id.to_string()))?;
        member.stop_acknowledged = true;
        self.check_stop(now)
    }

    /// stopping → aggregating once every connected member acked or the stop timeout passed.
    pub fn check_stop(&mut self, now: i64) -> Result<Option<AggregationPlan>, SessionError> {
        if self.state() != SessionState::Stopping {
            return Ok(None);
        }
        let deadline = self.stop_deadline.unwrap_or(now);
        let session = self.current_mut()?;
        let waiting = session
            .members
            .iter()
            .any(|m| !m.disconnected && !m.stop_acknowledged);
        if waiting && now < deadline {
            return Ok(None);
        }
        let session_id = session.session_id.clone();
        let mut unacked = Vec::new();
        let mut commands = Vec::new();
        for m in &mut session.members {
            if m.disconnected {
                m.aggregation = AggregationOutcome::Failed;
                continue;
            }
            if !m.stop_acknowledged {
                m.degraded = true;
                unacked.push(m.device_id.clone());
            }
            m.aggregation = AggregationOutcome::Pending;
            commands.push((
                m.device_id.clone(),
                Command::SendFiles {
                    session_id: session_id.clone(),
                },
            ));
        }
        self.stop_deadline = None;
        self.transition(SessionState::Aggregating, now)?;
        let archived = commands.is_empty();
        if archived {
            self.transition(SessionState::Archived, now)?;
        }
        self.persist(now)?;
        Ok(Some(AggregationPlan {
            unacked,
            commands,
            archived,
        }))
    }

    /// Commit a manifest entry produced by the aggregation handler. A later transfer of the
    /// same file replaces the earlier entry.
    pub fn record_file(&mut self, record: FileRecord, now: i64) -> Result<(), SessionError> {
        self.require(
            "commit a file",
            &[SessionState::Stopping, SessionState::Aggregating],
        )?;
        let session = self.current_mut()?;
        if !session.is_member(&record.device_id) {
            return Err(SessionError::NotMember(record.device_id));
        }
        match session
            .files
            .iter_mut()
            .find(|f| f.device_id == record.device_id && f.name == record.name)
        {
            Some(existing) => *existing = record,
            None => session.files.push(record),
        }
        self.persist(now)
    }

    /// A member finished (or permanently failed) its file transfer. Returns true when this
    /// archived the session.
    pub fn finish_member_aggregation(
        &mut self,
        device_id: &str,
        success: bool,
        now: i64,
    ) -> Result<bool, SessionError> {
        self.require("finish aggregation", &[SessionState::Aggregating])?;
        let session = self.current_mut()?;
        let member = session
            .member_mut(device_id)
            .ok_or_else(|| SessionError::NotMember(device_id.to_string()))?;
        if member.aggregation != AggregationOutcome::Pending {
            return Ok(false);
        }
        member.aggregation = if success {
            AggregationOutcome::Complete
        } else {
            AggregationOutcome::Failed
        };
        self.archive_if_done(now)
    }

    fn archive_if_done(&mut self, now: i64) -> Result<bool, SessionError> {
        let done = self.current.as_ref().is_some_and(|s| {
            s.state == SessionState::Aggregating
                && s.members
                    .iter()
                    .all(|m| m.aggregation != AggregationOutcome::Pending)
        });
        if done {
            self.transition(SessionState::Archived, now)?;
        }
        self.persist(now)?;
        Ok(done)
    }

    /// Any live state → aborted. Data already written is kept and the record is marked
    /// incomplete.
    pub fn abort(&mut self, reason: &str, now: i64) -> Result<(), SessionError> {
        let state = self.state();
        if state == SessionState::Idle {
            return Err(SessionError::NoSession);
        }
        if state.is_terminal() {
            return Err(SessionError::WrongState { op: "abort", state });
        }
        let session = self.current_mut()?;
        session.incomplete = true;
        session.abort_reason = Some(reason.to_string());
        for m in &mut session.members {
            if m.aggregation == AggregationOutcome::Pending {
                m.aggregation = AggregationOutcome::Failed;
            }
        }
        warn!(session_id = %session.session_id, reason, "session aborted");
        self.start_window_open = false;
        self.stop_deadline = None;
        self.transition(SessionState::Aborted, now)?;
        self.persist(now)
    }

    /// Abort a session that stayed in configuring past the arm timeout. Returns its id.
    pub fn check_arm_timeout(&mut self, now: i64) -> Result<Option<String>, SessionError> {
        let expired = match &self.current {
            Some(s) if s.state == SessionState::Configuring => {
                now.saturating_sub(s.created_at) > self.arm_timeout_ms
            }
            _ => false,
        };
        if !expired {
            return Ok(None);
        }
        let session_id = self
            .current
            .as_ref()
            .map(|s| s.session_id.clone())
            .unwrap_or_default();
        self.abort("not armed before the configuring timeout", now)?;
        Ok(Some(session_id))
    }

    /// Forget a terminal session.
    pub fn clear(&mut self) -> Result<(), SessionError> {
        if let Some(s) = &self.current {
            if !s.state.is_terminal() {
                return Err(SessionError::SessionActive(s.session_id.clone()));
            }
        }
        self.current = None;
        Ok(())
    }
}

fn start_command(session_id: &str, coordinator_start: i64, member: &SessionMember) -> Command {
    Command::StartRecording {
        session_id: session_id.to_string(),
        scheduled_start_timestamp: member.scheduled_start_local.unwrap_or(coordinator_start),
        recording_parameters: RecordingParameters {
            capabilities: member.capabilities.iter().copied().collect(),
            role: member.role,
            coordinator_start_timestamp: coordinator_start,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Hello, Status};
    use tempfile::TempDir;

    struct Rig {
        _dir: TempDir,
        registry: DeviceRegistry,
        clock: ClockSync,
        sessions: SessionManager,
    }

    /// Registry and clock with `ids` active and synchronised at offset 0.
    fn rig(ids: &[&str]) -> Rig {
        let cfg = CoordinatorConfig::default();
        let dir = TempDir::new().unwrap();
        let mut registry = DeviceRegistry::new(cfg.heartbeat_timeout_ms);
        let mut clock = ClockSync::new(&cfg);
        for id in ids {
            let hello = Hello {
                device_type: "android_phone".into(),
                capabilities: vec!["visual_camera".into()],
                app_version: "1.0".into(),
            };
            registry.register(id, &hello, 0).unwrap();
            let status = Status {
                battery_level: 80,
                storage_free: 1 << 30,
                recording_state: "idle".into(),
                connection_quality: None,
            };
            registry.update_status(id, &status, 0).unwrap();
            clock.record_sample(id, 1, 0, 5, 10).unwrap();
        }
        let sessions = SessionManager::new(SessionStore::new(dir.path()), &cfg);
        Rig {
            _dir: dir,
            registry,
            clock,
            sessions,
        }
    }

    fn recording(ids: &[&str]) -> Rig {
        let mut r = rig(ids);
        r.sessions.create("pilot", 1_000).unwrap();
        for id in ids {
            r.sessions.add_member(id, &r.registry, 1_000).unwrap();
        }
        r.sessions.arm(&r.registry, &r.clock, 2_000).unwrap();
        r.sessions.start(&r.registry, &r.clock, 3_000).unwrap();
        r
    }

    fn stored(r: &Rig) -> Session {
        let id = r.sessions.session().unwrap().session_id.clone();
        r.sessions.store().load(&id).unwrap()
    }

    #[test]
    fn transitions_are_forward_only() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Configuring));
        assert!(Recording.can_transition_to(Stopping));
        assert!(Recording.can_transition_to(Aborted));
        assert!(!Recording.can_transition_to(Configuring));
        assert!(!Stopping.can_transition_to(Recording));
        assert!(!Archived.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Configuring));
        assert!(!Configuring.can_transition_to(Recording));
    }

    #[test]
    fn session_id_is_timestamp_derived_and_unique() {
        let a = Session::new("x", 1_700_000_000_000);
        let b = Session::new("x", 1_700_000_000_000);
        assert!(a.session_id.starts_with("session_20231114_221320_"));
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn create_persists_record() {
        let mut r = rig(&[]);
        r.sessions.create("pilot", 5).unwrap();
        assert_eq!(r.sessions.state(), SessionState::Configuring);
        assert_eq!(stored(&r).label, "pilot");
        assert!(matches!(
            r.sessions.create("again", 6),
            Err(SessionError::SessionActive(_))
        ));
    }

    #[test]
    fn arm_requires_sync_sample() {
        let mut r = rig(&["A"]);
        let hello = Hello {
            device_type: "shimmer".into(),
            capabilities: vec!["gsr_sensor".into()],
            app_version: "1.0".into(),
        };
        r.registry.register("B", &hello, 0).unwrap();
        r.sessions.create("pilot", 0).unwrap();
        r.sessions.add_member("A", &r.registry, 0).unwrap();
        r.sessions.add_member("B", &r.registry, 0).unwrap();
        match r.sessions.arm(&r.registry, &r.clock, 1) {
            Err(SessionError::NotReady(ids)) => assert_eq!(ids, vec!["B".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r.sessions.state(), SessionState::Configuring);
        r.clock.record_sample("B", 1, 0, 5, 10).unwrap();
        r.sessions.arm(&r.registry, &r.clock, 2).unwrap();
        assert_eq!(r.sessions.state(), SessionState::Armed);
    }

    #[test]
    fn arm_without_members_fails() {
        let mut r = rig(&[]);
        r.sessions.create("pilot", 0).unwrap();
        assert!(matches!(
            r.sessions.arm(&r.registry, &r.clock, 1),
            Err(SessionError::NoMembers)
        ));
    }

    #[test]
    fn start_converts_to_node_time() {
        let mut r = rig(&["A"]);
        r.clock.record_sample("B", 1, 0, 255, 10).unwrap();
        let hello = Hello {
            device_type: "topdon".into(),
            capabilities: vec!["thermal_camera".into()],
            app_version: "1.0".into(),
        };
        r.registry.register("B", &hello, 0).unwrap();
        r.sessions.create("pilot", 0).unwrap();
        r.sessions.add_member("A", &r.registry, 0).unwrap();
        r.sessions.add_member("B", &r.registry, 0).unwrap();
        r.sessions.arm(&r.registry, &r.clock, 10).unwrap();
        let plan = r.sessions.start(&r.registry, &r.clock, 10).unwrap();
        assert_eq!(plan.start_time, 2_510);
        assert_eq!(plan.commands.len(), 2);
        for (id, cmd) in &plan.commands {
            let Command::StartRecording {
                scheduled_start_timestamp,
                recording_parameters,
                ..
            } = cmd
            else {
                panic!("not a start command");
            };
            assert_eq!(recording_parameters.coordinator_start_timestamp, 2_510);
            match id.as_str() {
                "A" => assert_eq!(*scheduled_start_timestamp, 2_510),
                "B" => assert_eq!(*scheduled_start_timestamp, 2_510 + 250),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn unacked_members_excluded_at_start_time() {
        let mut r = recording(&["A", "B"]);
        let start = r.sessions.session().unwrap().start_time.unwrap();
        assert_eq!(r.sessions.on_start_ack("A", true, 3_100).unwrap(), None);
        assert_eq!(r.sessions.close_start_window(start - 1, false).unwrap(), None);
        let closed = r.sessions.close_start_window(start, false).unwrap().unwrap();
        assert_eq!(closed.excluded, vec!["B".to_string()]);
        assert!(!closed.aborted);
        let session = r.sessions.session().unwrap();
        assert_eq!(session.members.len(), 1);
        assert_eq!(session.excluded, vec!["B".to_string()]);
    }

    #[test]
    fn all_acks_close_window_early() {
        let mut r = recording(&["A", "B"]);
        r.sessions.on_start_ack("A", true, 3_100).unwrap();
        let closed = r.sessions.on_start_ack("B", true, 3_200).unwrap().unwrap();
        assert!(closed.excluded.is_empty());
        assert_eq!(r.sessions.session().unwrap().members.len(), 2);
    }

    #[test]
    fn no_acks_aborts() {
        let mut r = recording(&["A"]);
        let closed = r.sessions.close_start_window(10_000, false).unwrap().unwrap();
        assert!(closed.aborted);
        assert_eq!(r.sessions.state(), SessionState::Aborted);
        assert!(stored(&r).incomplete);
    }

    #[test]
    fn disconnect_then_reconnect_records_gap_and_resends_start() {
        let mut r = recording(&["A", "B"]);
        r.sessions.on_start_ack("A", true, 3_100).unwrap();
        r.sessions.on_start_ack("B", true, 3_100).unwrap();
        assert_eq!(
            r.sessions.on_member_disconnected("B", 10_000).unwrap(),
            DisconnectEffect::Degraded
        );
        assert_eq!(r.sessions.state(), SessionState::Recording);
        let cmd = r.sessions.on_member_reconnected("B", 12_000).unwrap().unwrap();
        let start = r.sessions.session().unwrap().start_time.unwrap();
        assert!(matches!(
            cmd,
            Command::StartRecording { recording_parameters, .. }
                if recording_parameters.coordinator_start_timestamp == start
        ));
        let member = stored(&r).member("B").cloned().unwrap();
        assert!(member.degraded);
        assert!(!member.disconnected);
        assert_eq!(
            member.gaps,
            vec![Gap {
                from: 10_000,
                to: Some(12_000)
            }]
        );
    }

    #[test]
    fn losing_every_member_aborts() {
        let mut r = recording(&["A", "B"]);
        r.sessions.on_member_disconnected("A", 4_000).unwrap();
        assert_eq!(
            r.sessions.on_member_disconnected("B", 4_100).unwrap(),
            DisconnectEffect::SessionAborted
        );
        assert_eq!(r.sessions.state(), SessionState::Aborted);
    }

    #[test]
    fn events_never_go_backwards() {
        let mut r = recording(&["A"]);
        let start = r.sessions.session().unwrap().start_time.unwrap();
        r.sessions.add_event("stim-1", "operator", start + 100, start + 100).unwrap();
        let late = r.sessions.add_event("stim-0", "A", start + 50, start + 120).unwrap();
        assert_eq!(late.timestamp_ms, 100);
        let ts: Vec<i64> = stored(&r).events.iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(ts, vec![100, 100]);
    }

    #[test]
    fn end_time_set_once_by_stop() {
        let mut r = recording(&["A"]);
        r.sessions.on_start_ack("A", true, 3_100).unwrap();
        let plan = r.sessions.stop(20_000).unwrap();
        assert_eq!(plan.end_time, 20_000);
        assert_eq!(plan.commands.len(), 1);
        assert!(matches!(
            r.sessions.stop(21_000),
            Err(SessionError::WrongState { .. })
        ));
        assert_eq!(r.sessions.session().unwrap().end_time, Some(20_000));
    }

    #[test]
    fn stop_timeout_degrades_silent_members() {
        let mut r = recording(&["A", "B"]);
        r.sessions.on_start_ack("A", true, 3_100).unwrap();
        r.sessions.on_start_ack("B", true, 3_100).unwrap();
        r.sessions.stop(20_000).unwrap();
        assert_eq!(r.sessions.on_stop_ack("A", 20_100).unwrap(), None);
        assert_eq!(r.sessions.check_stop(29_999).unwrap(), None);
        let plan = r.sessions.check_stop(30_000).unwrap().unwrap();
        assert_eq!(plan.unacked, vec!["B".to_string()]);
        assert_eq!(plan.commands.len(), 2);
        assert_eq!(r.sessions.state(), SessionState::Aggregating);
        assert!(r.sessions.session().unwrap().member("B").unwrap().degraded);
    }

    #[test]
    fn archived_after_every_member_finishes() {
        let mut r = recording(&["A", "B"]);
        r.sessions.on_start_ack("A", true, 3_100).unwrap();
        r.sessions.on_start_ack("B", true, 3_100).unwrap();
        r.sessions.stop(20_000).unwrap();
        r.sessions.on_stop_ack("A", 20_100).unwrap();
        assert!(r.sessions.on_stop_ack("B", 20_200).unwrap().is_some());
        r.sessions
            .record_file(
                FileRecord {
                    device_id: "A".into(),
                    name: "video.mp4".into(),
                    path: PathBuf::from("A/video.mp4"),
                    size_bytes: 10,
                    declared_size: 10,
                    checksum: "00".into(),
                    status: FileStatus::Complete,
                    committed_at: 21_000,
                },
                21_000,
            )
            .unwrap();
        assert!(!r.sessions.finish_member_aggregation("A", true, 21_000).unwrap());
        assert_eq!(
            r.sessions.on_member_disconnected("B", 22_000).unwrap(),
            DisconnectEffect::AggregationFailed { archived: true }
        );
        let rec = stored(&r);
        assert_eq!(rec.state, SessionState::Archived);
        assert_eq!(rec.files.len(), 1);
        let states: Vec<SessionState> = rec.history.iter().map(|h| h.state).collect();
        assert_eq!(
            states,
            vec![
                SessionState::Configuring,
                SessionState::Armed,
                SessionState::Recording,
                SessionState::Stopping,
                SessionState::Aggregating,
                SessionState::Archived,
            ]
        );
    }

    #[test]
    fn recommitted_file_replaces_manifest_entry() {
        let mut r = recording(&["A"]);
        r.sessions.on_start_ack("A", true, 3_100).unwrap();
        r.sessions.stop(20_000).unwrap();
        r.sessions.on_stop_ack("A", 20_100).unwrap();
        let entry = |size_bytes, status, committed_at| FileRecord {
            device_id: "A".into(),
            name: "video.mp4".into(),
            path: PathBuf::from("A/video.mp4"),
            size_bytes,
            declared_size: 10,
            checksum: "00".into(),
            status,
            committed_at,
        };
        r.sessions
            .record_file(entry(4, FileStatus::Incomplete, 21_000), 21_000)
            .unwrap();
        r.sessions
            .record_file(entry(10, FileStatus::Complete, 22_000), 22_000)
            .unwrap();
        let rec = stored(&r);
        let files = &rec.files;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size_bytes, 10);
        assert_eq!(files[0].status, FileStatus::Complete);
    }

    #[test]
    fn configuring_timeout_aborts() {
        let mut r = rig(&[]);
        r.sessions.create("pilot", 0).unwrap();
        assert_eq!(r.sessions.check_arm_timeout(300_000).unwrap(), None);
        assert!(r.sessions.check_arm_timeout(300_001).unwrap().is_some());
        assert_eq!(r.sessions.state(), SessionState::Aborted);
    }

    #[test]
    fn persistence_failure_aborts_session() {
        let mut r = recording(&["A"]);
        let dir = r.sessions.session_dir().unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::write(&dir, b"not a directory").unwrap();
        let start = r.sessions.session().unwrap().start_time.unwrap();
        assert!(matches!(
            r.sessions.add_event("stim", "operator", start, start),
            Err(SessionError::Persist(_))
        ));
        assert_eq!(r.sessions.state(), SessionState::Aborted);
        let transitions = r.sessions.drain_transitions();
        assert_eq!(transitions.last().unwrap().to, SessionState::Aborted);
    }
}
