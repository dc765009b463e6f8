//! Host-driven API: the coordinator receives connection events, decoded frames, operator
//! commands and ticks from the host, and returns actions for the host to perform.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::aggregation::{ChunkOutcome, Completed, FileAggregator};
use crate::clock::{ClockSync, SyncError, SyncOutcome};
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::events::{CoordinatorEvent, Fault};
use crate::integrity::CorruptionTracker;
use crate::protocol::{Ack, AckStatus, Annotation, Hello, Message, Payload, SensorSample};
use crate::registry::{ConnectionState, DeviceRegistry, RegistryEvent, RemoteNode, Role};
use crate::session::{
    AggregationPlan, FileStatus, Session, SessionError, SessionManager, SessionState,
    StartWindowClosed,
};
use crate::store::SessionStore;
use crate::wire;

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Encoded JSON envelope for the node; the host frames and encrypts it.
    SendMessage(String, Vec<u8>),
    /// Close the node's channel.
    Disconnect(String),
    Event(CoordinatorEvent),
}

/// Main coordinator. Single owner of registry, clock engine, session and file handler.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: DeviceRegistry,
    clock: ClockSync,
    sessions: SessionManager,
    files: FileAggregator,
    corruption: CorruptionTracker,
    open_channels: HashSet<String>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, store: SessionStore) -> Self {
        Self {
            registry: DeviceRegistry::new(config.heartbeat_timeout_ms),
            clock: ClockSync::new(&config),
            sessions: SessionManager::new(store, &config),
            files: FileAggregator::new(config.chunk_timeout_ms),
            corruption: CorruptionTracker::new(),
            open_channels: HashSet::new(),
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn nodes(&self) -> Vec<&RemoteNode> {
        self.registry.nodes()
    }

    pub fn session(&self) -> Option<&Session> {
        self.sessions.session()
    }

    pub fn session_state(&self) -> SessionState {
        self.sessions.state()
    }

    /// Transport accepted a channel for `device_id` (handshake done).
    pub fn on_connection_opened(&mut self, device_id: &str, now: i64) -> Vec<OutboundAction> {
        self.open_channels.insert(device_id.to_string());
        self.registry.mark_attached(device_id, now);
        debug!(device_id, "channel opened");
        let mut actions = Vec::new();
        self.drain_events(&mut actions);
        actions
    }

    /// Transport channel closed (peer hang-up, read error, or after a `Disconnect` action).
    pub fn on_connection_closed(&mut self, device_id: &str, now: i64) -> Vec<OutboundAction> {
        self.open_channels.remove(device_id);
        let mut actions = Vec::new();
        if self.registry.mark_disconnected(device_id) {
            info!(device_id, "node disconnected");
        }
        self.node_lost(device_id, now, &mut actions);
        self.drain_events(&mut actions);
        actions
    }

    /// Process one decrypted frame body from `device_id`.
    pub fn on_frame(&mut self, device_id: &str, bytes: &[u8], now: i64) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        match wire::decode_message(bytes) {
            Ok(msg) if msg.device_id != device_id => {
                let err = CoordinatorError::DeviceMismatch {
                    channel: device_id.to_string(),
                    message: msg.device_id,
                };
                self.corrupt_frame(device_id, err.to_string(), now, &mut actions);
            }
            Ok(msg) => self.on_message(device_id, msg, now, &mut actions),
            Err(e) => self.corrupt_frame(device_id, e.to_string(), now, &mut actions),
        }
        self.drain_events(&mut actions);
        actions
    }

    fn corrupt_frame(
        &mut self,
        device_id: &str,
        reason: String,
        now: i64,
        actions: &mut Vec<OutboundAction>,
    ) {
        let count = self.corruption.record_failure(device_id);
        warn!(device_id, count, %reason, "dropping malformed frame");
        self.send(device_id, now, Payload::Nack { reason: reason.clone() }, actions);
        fault(
            actions,
            Fault::MalformedMessage {
                device_id: device_id.to_string(),
                reason,
            },
        );
        if self
            .corruption
            .is_isolated(device_id, self.config.max_corrupt_frames)
        {
            warn!(device_id, "corruption threshold reached, dropping channel");
            actions.push(OutboundAction::Disconnect(device_id.to_string()));
        }
    }

    fn on_message(
        &mut self,
        device_id: &str,
        msg: Message,
        now: i64,
        actions: &mut Vec<OutboundAction>,
    ) {
        if let Payload::Hello(hello) = &msg.body {
            self.on_hello(device_id, hello, now, actions);
            return;
        }
        match self.registry.get(device_id).map(|n| n.state) {
            None | Some(ConnectionState::Disconnected) => {
                fault(
                    actions,
                    Fault::UnknownDevice {
                        device_id: device_id.to_string(),
                    },
                );
                return;
            }
            Some(ConnectionState::Attached) => {
                self.send(
                    device_id,
                    now,
                    Payload::Nack {
                        reason: "hello required".into(),
                    },
                    actions,
                );
                return;
            }
            Some(_) => {}
        }
        self.registry.touch(device_id, now);

        let message_type = msg.message_type();
        match msg.body {
            Payload::Hello(_) => {}
            Payload::Status(status) => {
                if let Err(e) = self.registry.update_status(device_id, &status, now) {
                    debug!(device_id, error = %e, "status rejected");
                }
            }
            Payload::Sync(reply) => match self.clock.on_reply(device_id, &reply, now) {
                Ok(outcome) => self.on_sync_outcome(device_id, outcome, now, actions),
                Err(e @ SyncError::ImplausibleTimestamp { .. }) => {
                    warn!(device_id, error = %e, "sync reply rejected")
                }
                Err(e) => debug!(device_id, error = %e, "sync reply ignored"),
            },
            Payload::Ack(ack) => self.on_ack(device_id, ack, now, actions),
            Payload::FileInfo { name, size } => self.on_file_info(device_id, &name, size, now, actions),
            Payload::FileChunk { data } => match self.files.on_file_chunk(device_id, &data, now) {
                Ok(ChunkOutcome::Written(_)) => {}
                Ok(ChunkOutcome::Failed(done)) => self.close_failed_transfer(done, now, actions),
                Err(e) => self.reject(device_id, e.to_string(), now, actions),
            },
            Payload::FileEnd { name } => match self.files.on_file_end(device_id, &name, now) {
                Ok(done) => self.commit_file(done, now, actions),
                Err(e) => self.reject(device_id, e.to_string(), now, actions),
            },
            Payload::PreviewFrame { encoded_image } => {
                actions.push(OutboundAction::Event(CoordinatorEvent::PreviewFrame {
                    device_id: device_id.to_string(),
                    encoded_image,
                }));
            }
            Payload::SensorData { samples } => {
                let samples: Vec<SensorSample> = samples
                    .into_iter()
                    .map(|s| SensorSample {
                        timestamp: self.to_coordinator_time(device_id, s.timestamp, s.timestamp),
                        values: s.values,
                    })
                    .collect();
                actions.push(OutboundAction::Event(CoordinatorEvent::SensorData {
                    device_id: device_id.to_string(),
                    samples,
                    synchronised: self.clock.is_synchronised(device_id),
                }));
            }
            Payload::Notification(Annotation { timestamp, label }) => {
                actions.push(OutboundAction::Event(CoordinatorEvent::Notification {
                    device_id: device_id.to_string(),
                    timestamp: self.to_coordinator_time(device_id, timestamp, now),
                    label,
                }));
            }
            Payload::StimulusEvent(Annotation { timestamp, label }) => {
                let at = self.to_coordinator_time(device_id, timestamp, now);
                self.record_stimulus(&label, device_id, at, now, actions);
            }
            Payload::Command(_)
            | Payload::FileReceived(_)
            | Payload::Nack { .. }
            | Payload::Beacon { .. } => {
                self.reject(
                    device_id,
                    format!("unexpected {message_type} from node"),
                    now,
                    actions,
                );
            }
        }
    }

    fn on_hello(
        &mut self,
        device_id: &str,
        hello: &Hello,
        now: i64,
        actions: &mut Vec<OutboundAction>,
    ) {
        let registered = self.registry.register(device_id, hello, now).map(|_| ());
        if let Err(e) = registered {
            self.reject(device_id, e.to_string(), now, actions);
            return;
        }
        info!(device_id, device_type = %hello.device_type, "node registered");
        self.corruption.reset(device_id);
        let request = self.clock.begin_round(device_id, now);
        self.send(device_id, now, Payload::Sync(request), actions);
        match self.sessions.on_member_reconnected(device_id, now) {
            Ok(Some(command)) => self.send(device_id, now, Payload::Command(command), actions),
            Ok(None) => {}
            Err(e) => session_failed(&e),
        }
    }

    fn on_sync_outcome(
        &mut self,
        device_id: &str,
        outcome: SyncOutcome,
        now: i64,
        actions: &mut Vec<OutboundAction>,
    ) {
        actions.push(OutboundAction::Event(CoordinatorEvent::SyncUpdated {
            device_id: device_id.to_string(),
            offset_ms: outcome.offset_ms,
            rtt_ms: outcome.sample.rtt_ms,
            quality: outcome.quality,
            accepted: outcome.sample.accepted,
        }));
        if outcome.lost_sync {
            self.sync_lost(device_id, outcome.quality, now, actions);
        }
        if outcome.regained_sync && self.registry.restore(device_id) {
            info!(device_id, "sync quality restored");
        }
    }

    fn sync_lost(
        &mut self,
        device_id: &str,
        quality: f64,
        now: i64,
        actions: &mut Vec<OutboundAction>,
    ) {
        warn!(device_id, quality, "sync quality lost; data will be unaligned");
        self.registry.mark_degraded(device_id);
        if let Err(e) = self.sessions.mark_unsynchronised(device_id, now) {
            session_failed(&e);
        }
        fault(
            actions,
            Fault::SyncQualityDegraded {
                device_id: device_id.to_string(),
                quality,
            },
        );
    }

    fn on_ack(&mut self, device_id: &str, ack: Ack, now: i64, actions: &mut Vec<OutboundAction>) {
        let ok = ack.status != AckStatus::Error;
        if !ok {
            warn!(device_id, cmd = %ack.cmd, message = ?ack.message, "command failed on node");
        }
        match ack.cmd.as_str() {
            "start_recording" => match self.sessions.on_start_ack(device_id, ok, now) {
                Ok(closed) => self.on_start_window(closed, actions),
                Err(e) => session_failed(&e),
            },
            "stop_recording" => match self.sessions.on_stop_ack(device_id, now) {
                Ok(plan) => self.on_aggregation_plan(plan, now, actions),
                Err(e) => session_failed(&e),
            },
            "send_files" => {
                if ack.status == AckStatus::Ok {
                    return;
                }
                if let Some(done) = self.files.abandon(device_id, now) {
                    self.commit_file(done, now, actions);
                }
                if let Err(e) = self.sessions.finish_member_aggregation(device_id, ok, now) {
                    session_failed(&e);
                }
            }
            other => debug!(device_id, cmd = other, "ack for unknown command"),
        }
    }

    fn on_file_info(
        &mut self,
        device_id: &str,
        name: &str,
        size: u64,
        now: i64,
        actions: &mut Vec<OutboundAction>,
    ) {
        let accepting = matches!(
            self.sessions.state(),
            SessionState::Stopping | SessionState::Aggregating
        ) && self.sessions.is_member(device_id);
        let dir = match self.sessions.session_dir() {
            Some(dir) if accepting => dir,
            _ => {
                self.reject(device_id, "no session is collecting files".into(), now, actions);
                return;
            }
        };
        let committed = self.sessions.session().map_or(&[][..], |s| s.files.as_slice());
        match self.files.on_file_info(&dir, device_id, name, size, committed, now) {
            Ok(()) => self.send(
                device_id,
                now,
                Payload::Ack(Ack {
                    cmd: "file_info".into(),
                    status: AckStatus::Ok,
                    message: None,
                }),
                actions,
            ),
            Err(e) => self.reject(device_id, e.to_string(), now, actions),
        }
    }

    /// Commit a transfer that closed without its `file_end` and count the member's
    /// aggregation as failed.
    fn close_failed_transfer(&mut self, done: Completed, now: i64, actions: &mut Vec<OutboundAction>) {
        let device_id = done.record.device_id.clone();
        self.commit_file(done, now, actions);
        if self.sessions.state() == SessionState::Aggregating {
            if let Err(e) = self.sessions.finish_member_aggregation(&device_id, false, now) {
                session_failed(&e);
            }
        }
    }

    fn commit_file(&mut self, done: Completed, now: i64, actions: &mut Vec<OutboundAction>) {
        let Completed {
            record,
            reply,
            discarded,
        } = done;
        let device_id = record.device_id.clone();
        self.send(&device_id, now, Payload::FileReceived(reply), actions);
        if record.status == FileStatus::Incomplete {
            fault(
                actions,
                Fault::FileTransferMismatch {
                    device_id: device_id.clone(),
                    name: record.name.clone(),
                    declared: record.declared_size,
                    received: record.size_bytes,
                },
            );
        }
        if discarded {
            return;
        }
        match self.sessions.record_file(record.clone(), now) {
            Ok(()) => actions.push(OutboundAction::Event(CoordinatorEvent::FileCommitted(record))),
            Err(e) => session_failed(&e),
        }
    }

    fn record_stimulus(
        &mut self,
        label: &str,
        source: &str,
        at: i64,
        now: i64,
        actions: &mut Vec<OutboundAction>,
    ) {
        match self.sessions.add_event(label, source, at, now) {
            Ok(event) => {
                let session_id = self
                    .sessions
                    .session()
                    .map(|s| s.session_id.clone())
                    .unwrap_or_default();
                actions.push(OutboundAction::Event(CoordinatorEvent::StimulusRecorded {
                    session_id,
                    event,
                }));
            }
            Err(e) => session_failed(&e),
        }
    }

    fn on_start_window(&mut self, closed: Option<StartWindowClosed>, actions: &mut Vec<OutboundAction>) {
        let Some(closed) = closed else {
            return;
        };
        if closed.excluded.is_empty() {
            return;
        }
        let session_id = self
            .sessions
            .session()
            .map(|s| s.session_id.clone())
            .unwrap_or_default();
        fault(
            actions,
            Fault::StartBroadcastPartialFailure {
                session_id,
                excluded: closed.excluded,
            },
        );
    }

    fn on_aggregation_plan(
        &mut self,
        plan: Option<AggregationPlan>,
        now: i64,
        actions: &mut Vec<OutboundAction>,
    ) {
        let Some(plan) = plan else {
            return;
        };
        if !plan.unacked.is_empty() {
            warn!(unacked = ?plan.unacked, "stop not acknowledged; nodes degraded");
        }
        for (device_id, command) in plan.commands {
            self.send(&device_id, now, Payload::Command(command), actions);
        }
    }

    /// Common handling for a channel that closed or timed out.
    fn node_lost(&mut self, device_id: &str, now: i64, actions: &mut Vec<OutboundAction>) {
        self.clock.forget_pending(device_id);
        if let Some(done) = self.files.abandon(device_id, now) {
            self.commit_file(done, now, actions);
        }
        if let Err(e) = self.sessions.on_member_disconnected(device_id, now) {
            session_failed(&e);
        }
    }

    /// Periodic driver: heartbeat and sync timeouts, sync rounds, session deadlines, stale
    /// file transfers.
    pub fn tick(&mut self, now: i64) -> Vec<OutboundAction> {
        let mut actions = Vec::new();

        for device_id in self.registry.mark_heartbeat_timeouts(now) {
            warn!(device_id = %device_id, "heartbeat timeout");
            fault(
                &mut actions,
                Fault::HeartbeatTimeout {
                    device_id: device_id.clone(),
                },
            );
            self.node_lost(&device_id, now, &mut actions);
            if self.open_channels.contains(&device_id) {
                actions.push(OutboundAction::Disconnect(device_id));
            }
        }

        for missed in self.clock.expire_pending(now) {
            debug!(device_id = %missed.device_id, sequence = missed.sequence, "sync round missed");
            if missed.quality_lost {
                self.sync_lost(&missed.device_id, 0.0, now, &mut actions);
            }
        }

        let candidates: Vec<String> = self
            .registry
            .nodes()
            .into_iter()
            .filter(|n| {
                matches!(
                    n.state,
                    ConnectionState::Registered | ConnectionState::Active | ConnectionState::Degraded
                )
            })
            .map(|n| n.device_id.clone())
            .collect();
        for (device_id, request) in self.clock.due_rounds(&candidates, now) {
            self.send(&device_id, now, Payload::Sync(request), &mut actions);
        }

        match self.sessions.close_start_window(now, false) {
            Ok(closed) => self.on_start_window(closed, &mut actions),
            Err(e) => session_failed(&e),
        }
        match self.sessions.check_stop(now) {
            Ok(plan) => self.on_aggregation_plan(plan, now, &mut actions),
            Err(e) => session_failed(&e),
        }
        match self.sessions.check_arm_timeout(now) {
            Ok(Some(session_id)) => fault(
                &mut actions,
                Fault::SessionCreateFailure {
                    reason: format!("{session_id} was not armed in time"),
                },
            ),
            Ok(None) => {}
            Err(e) => session_failed(&e),
        }

        for done in self.files.expire(now) {
            self.close_failed_transfer(done, now, &mut actions);
        }

        self.drain_events(&mut actions);
        actions
    }

    // Operator commands.

    pub fn create_session(
        &mut self,
        label: &str,
        now: i64,
    ) -> Result<Vec<OutboundAction>, CoordinatorError> {
        let mut actions = Vec::new();
        let res = self.sessions.create(label, now).map(|_| ());
        self.finish(res, &mut actions)?;
        Ok(actions)
    }

    /// Add a node to the session being configured.
    pub fn add_participant(
        &mut self,
        device_id: &str,
        now: i64,
    ) -> Result<Vec<OutboundAction>, CoordinatorError> {
        let mut actions = Vec::new();
        let res = self.sessions.add_member(device_id, &self.registry, now);
        self.finish(res, &mut actions)?;
        Ok(actions)
    }

    /// Assign a role; while configuring the node also joins the session.
    pub fn assign_role(
        &mut self,
        device_id: &str,
        role: Role,
        now: i64,
    ) -> Result<Vec<OutboundAction>, CoordinatorError> {
        self.registry.assign_role(device_id, role)?;
        if self.sessions.state() == SessionState::Configuring {
            return self.add_participant(device_id, now);
        }
        Ok(Vec::new())
    }

    /// configuring → armed. With no explicit participants, every ready node joins.
    pub fn arm(&mut self, now: i64) -> Result<Vec<OutboundAction>, CoordinatorError> {
        let mut actions = Vec::new();
        let no_members = self.sessions.session().is_some_and(|s| s.members.is_empty());
        if no_members && self.sessions.state() == SessionState::Configuring {
            let ready: Vec<String> = self
                .registry
                .nodes()
                .into_iter()
                .filter(|n| matches!(n.state, ConnectionState::Registered | ConnectionState::Active))
                .map(|n| n.device_id.clone())
                .collect();
            for id in ready {
                let res = self.sessions.add_member(&id, &self.registry, now);
                self.finish(res, &mut actions)?;
            }
        }
        let res = self.sessions.arm(&self.registry, &self.clock, now);
        self.finish(res, &mut actions)?;
        Ok(actions)
    }

    /// armed → recording: one batch of start commands.
    pub fn start(&mut self, now: i64) -> Result<Vec<OutboundAction>, CoordinatorError> {
        let mut actions = Vec::new();
        let res = self.sessions.start(&self.registry, &self.clock, now);
        let plan = self.finish(res, &mut actions)?;
        info!(
            session_id = %plan.session_id,
            start_time = plan.start_time,
            nodes = plan.commands.len(),
            "start broadcast"
        );
        for (device_id, command) in plan.commands {
            self.send(&device_id, now, Payload::Command(command), &mut actions);
        }
        Ok(actions)
    }

    /// recording → stopping.
    pub fn stop(&mut self, now: i64) -> Result<Vec<OutboundAction>, CoordinatorError> {
        let mut actions = Vec::new();
        let res = self.sessions.close_start_window(now, true);
        let closed = self.finish(res, &mut actions)?;
        self.on_start_window(closed, &mut actions);
        let res = self.sessions.stop(now);
        let plan = self.finish(res, &mut actions)?;
        for (device_id, command) in plan.commands {
            self.send(&device_id, now, Payload::Command(command), &mut actions);
        }
        // Nodes may all be gone already.
        let res = self.sessions.check_stop(now);
        let agg = self.finish(res, &mut actions)?;
        self.on_aggregation_plan(agg, now, &mut actions);
        self.drain_events(&mut actions);
        Ok(actions)
    }

    /// Operator stimulus marker, stamped now.
    pub fn add_stimulus(
        &mut self,
        label: &str,
        now: i64,
    ) -> Result<Vec<OutboundAction>, CoordinatorError> {
        let mut actions = Vec::new();
        let res = self.sessions.add_event(label, "operator", now, now);
        let event = self.finish(res, &mut actions)?;
        let session_id = self
            .sessions
            .session()
            .map(|s| s.session_id.clone())
            .unwrap_or_default();
        actions.push(OutboundAction::Event(CoordinatorEvent::StimulusRecorded {
            session_id,
            event,
        }));
        Ok(actions)
    }

    pub fn abort(&mut self, reason: &str, now: i64) -> Result<Vec<OutboundAction>, CoordinatorError> {
        let mut actions = Vec::new();
        for done in self.files.abandon_all(now) {
            self.commit_file(done, now, &mut actions);
        }
        let res = self.sessions.abort(reason, now);
        self.finish(res, &mut actions)?;
        Ok(actions)
    }

    /// Administrative reset: abort any live session and forget every node.
    pub fn reset(&mut self, now: i64) -> Result<Vec<OutboundAction>, CoordinatorError> {
        let mut actions = Vec::new();
        if !self.sessions.state().is_terminal() && self.sessions.state() != SessionState::Idle {
            actions.extend(self.abort("administrative reset", now)?);
        }
        self.sessions.clear()?;
        for id in self.registry.reset() {
            self.corruption.reset(&id);
            if self.open_channels.contains(&id) {
                actions.push(OutboundAction::Disconnect(id));
            }
        }
        self.clock.clear();
        info!("coordinator reset");
        Ok(actions)
    }

    /// Stop an active recording and flush the metadata record.
    pub fn shutdown(&mut self, now: i64) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        if self.sessions.state() == SessionState::Recording {
            match self.stop(now) {
                Ok(a) => actions.extend(a),
                Err(e) => warn!(error = %e, "stop on shutdown failed"),
            }
        }
        if let Err(e) = self.sessions.flush(now) {
            warn!(error = %e, "metadata flush on shutdown failed");
        }
        self.drain_events(&mut actions);
        actions
    }

    /// Drain events for a session operation result; errors are passed on after the events.
    fn finish<T>(
        &mut self,
        res: Result<T, SessionError>,
        actions: &mut Vec<OutboundAction>,
    ) -> Result<T, CoordinatorError> {
        self.drain_events(actions);
        Ok(res?)
    }

    fn to_coordinator_time(&self, device_id: &str, node_time: i64, fallback: i64) -> i64 {
        self.clock
            .corrected_time(device_id, node_time)
            .map_or(fallback, |t| t.as_millis())
    }

    fn send(&self, device_id: &str, now: i64, body: Payload, actions: &mut Vec<OutboundAction>) {
        let msg = Message::from_coordinator(now, body);
        match wire::encode_message(&msg) {
            Ok(bytes) => actions.push(OutboundAction::SendMessage(device_id.to_string(), bytes)),
            Err(e) => warn!(device_id, message_type = msg.message_type(), error = %e, "encode failed"),
        }
    }

    /// Protocol-level rejection that is not frame corruption.
    fn reject(&self, device_id: &str, reason: String, now: i64, actions: &mut Vec<OutboundAction>) {
        debug!(device_id, %reason, "message rejected");
        self.send(device_id, now, Payload::Nack { reason: reason.clone() }, actions);
        fault(
            actions,
            Fault::MalformedMessage {
                device_id: device_id.to_string(),
                reason,
            },
        );
    }

    fn drain_events(&mut self, actions: &mut Vec<OutboundAction>) {
        for ev in self.registry.drain_events() {
            let event = match ev {
                RegistryEvent::Registered {
                    device_id,
                    capabilities,
                    reconnect,
                } => CoordinatorEvent::NodeRegistered {
                    device_id,
                    capabilities,
                    reconnect,
                },
                RegistryEvent::StateChanged { device_id, from, to } => {
                    CoordinatorEvent::NodeStateChanged { device_id, from, to }
                }
            };
            actions.push(OutboundAction::Event(event));
        }
        for t in self.sessions.drain_transitions() {
            actions.push(OutboundAction::Event(CoordinatorEvent::SessionStateChanged {
                session_id: t.session_id,
                from: t.from,
                to: t.to,
            }));
        }
    }
}

fn fault(actions: &mut Vec<OutboundAction>, f: Fault) {
    actions.push(OutboundAction::Event(f.into()));
}

fn session_failed(e: &SessionError) {
    match e {
        SessionError::Persist(_) => warn!(error = %e, "session aborted"),
        _ => debug!(error = %e, "session operation skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Status, SyncPayload};
    use tempfile::TempDir;

    fn coordinator() -> (TempDir, Coordinator) {
        let dir = TempDir::new().unwrap();
        let c = Coordinator::new(CoordinatorConfig::default(), SessionStore::new(dir.path()));
        (dir, c)
    }

    fn frame(device_id: &str, ts: i64, body: Payload) -> Vec<u8> {
        wire::encode_message(&Message::new(device_id, ts, body)).unwrap()
    }

    fn hello(caps: &[&str]) -> Payload {
        Payload::Hello(Hello {
            device_type: "android_phone".into(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            app_version: "2.1.0".into(),
        })
    }

    fn status() -> Payload {
        Payload::Status(Status {
            battery_level: 85,
            storage_free: 10_000_000_000,
            recording_state: "idle".into(),
            connection_quality: None,
        })
    }

    fn sent(actions: &[OutboundAction]) -> Vec<(String, Message)> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::SendMessage(id, bytes) => {
                    Some((id.clone(), wire::decode_message(bytes).unwrap()))
                }
                _ => None,
            })
            .collect()
    }

    fn faults(actions: &[OutboundAction]) -> Vec<Fault> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Event(CoordinatorEvent::Fault(f)) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn hello_then_status_makes_node_active() {
        let (_dir, mut c) = coordinator();
        c.on_connection_opened("phone-1", 0);
        let actions = c.on_frame(
            "phone-1",
            &frame("phone-1", 0, hello(&["visual_camera", "gsr_sensor"])),
            0,
        );
        assert!(actions.iter().any(|a| matches!(
            a,
            OutboundAction::Event(CoordinatorEvent::NodeRegistered { device_id, reconnect: false, .. })
                if device_id == "phone-1"
        )));
        let out = sent(&actions);
        assert!(matches!(out[0].1.body, Payload::Sync(_)));
        assert_eq!(out[0].1.device_id, crate::protocol::COORDINATOR_ID);
        assert_eq!(c.registry().get("phone-1").unwrap().state, ConnectionState::Registered);

        c.on_frame("phone-1", &frame("phone-1", 10, status()), 10);
        let node = c.registry().get("phone-1").unwrap();
        assert_eq!(node.state, ConnectionState::Active);
        assert_eq!(node.battery_level, Some(85));
        assert_eq!(node.capabilities.len(), 2);
    }

    #[test]
    fn unknown_capability_is_rejected() {
        let (_dir, mut c) = coordinator();
        let actions = c.on_frame("x", &frame("x", 0, hello(&["lidar"])), 0);
        assert!(matches!(faults(&actions)[0], Fault::MalformedMessage { .. }));
        assert!(c.registry().get("x").is_none());
    }

    #[test]
    fn message_before_hello_is_unknown_device() {
        let (_dir, mut c) = coordinator();
        let actions = c.on_frame("ghost", &frame("ghost", 0, status()), 0);
        assert_eq!(
            faults(&actions),
            vec![Fault::UnknownDevice {
                device_id: "ghost".into()
            }]
        );
    }

    #[test]
    fn corrupt_frames_nacked_until_threshold() {
        let (_dir, mut c) = coordinator();
        c.on_frame("phone-1", &frame("phone-1", 0, hello(&["visual_camera"])), 0);
        let good = String::from_utf8(frame("phone-1", 1, status())).unwrap();
        let bad = good.replace("\"battery_level\":85", "\"battery_level\":86");
        assert_ne!(good, bad);
        for i in 1..=3 {
            let actions = c.on_frame("phone-1", bad.as_bytes(), i);
            assert!(sent(&actions)
                .iter()
                .any(|(_, m)| matches!(m.body, Payload::Nack { .. })));
            assert!(matches!(faults(&actions)[0], Fault::MalformedMessage { .. }));
            let dropped = actions
                .iter()
                .any(|a| matches!(a, OutboundAction::Disconnect(_)));
            assert_eq!(dropped, i == 3);
        }
        assert_eq!(c.registry().get("phone-1").unwrap().battery_level, None);
    }

    #[test]
    fn spoofed_device_id_is_dropped() {
        let (_dir, mut c) = coordinator();
        c.on_frame("phone-1", &frame("phone-1", 0, hello(&["visual_camera"])), 0);
        let actions = c.on_frame("phone-1", &frame("phone-2", 1, status()), 1);
        assert!(matches!(faults(&actions)[0], Fault::MalformedMessage { .. }));
        assert!(c.registry().get("phone-2").is_none());
    }

    #[test]
    fn sync_reply_updates_estimate() {
        let (_dir, mut c) = coordinator();
        let actions = c.on_frame("phone-1", &frame("phone-1", 1_000, hello(&["visual_camera"])), 1_000);
        let (_, req) = sent(&actions).remove(0);
        let Payload::Sync(SyncPayload { sync_sequence, .. }) = req.body else {
            panic!("expected sync request");
        };
        let reply = Payload::Sync(SyncPayload {
            master_timestamp: Some(1_000),
            node_timestamp: Some(1_005),
            sync_sequence,
        });
        let actions = c.on_frame("phone-1", &frame("phone-1", 1_005, reply), 1_012);
        assert!(actions.iter().any(|a| matches!(
            a,
            OutboundAction::Event(CoordinatorEvent::SyncUpdated { offset_ms, .. }) if *offset_ms == -1.0
        )));
        assert!(c.clock().has_valid_sample("phone-1"));
    }

    #[test]
    fn heartbeat_timeout_reported_once() {
        let (_dir, mut c) = coordinator();
        c.on_connection_opened("phone-1", 0);
        c.on_frame("phone-1", &frame("phone-1", 0, hello(&["visual_camera"])), 0);
        c.on_frame("phone-1", &frame("phone-1", 0, status()), 0);
        let actions = c.tick(30_001);
        let timeouts = faults(&actions)
            .into_iter()
            .filter(|f| matches!(f, Fault::HeartbeatTimeout { .. }))
            .count();
        assert_eq!(timeouts, 1);
        assert!(actions.contains(&OutboundAction::Disconnect("phone-1".into())));
        assert_eq!(c.registry().get("phone-1").unwrap().state, ConnectionState::Disconnected);
        let again = c.tick(30_002);
        assert!(faults(&again)
            .iter()
            .all(|f| !matches!(f, Fault::HeartbeatTimeout { .. })));
    }

    #[test]
    fn reconnect_sends_fresh_hello_required() {
        let (_dir, mut c) = coordinator();
        c.on_connection_opened("phone-1", 0);
        c.on_frame("phone-1", &frame("phone-1", 0, hello(&["visual_camera"])), 0);
        c.on_connection_closed("phone-1", 10);
        c.on_connection_opened("phone-1", 20);
        assert_eq!(c.registry().get("phone-1").unwrap().state, ConnectionState::Attached);
        let actions = c.on_frame("phone-1", &frame("phone-1", 21, status()), 21);
        assert!(sent(&actions)
            .iter()
            .any(|(_, m)| matches!(&m.body, Payload::Nack { reason } if reason == "hello required")));
        let actions = c.on_frame("phone-1", &frame("phone-1", 22, hello(&["visual_camera"])), 22);
        assert!(actions.iter().any(|a| matches!(
            a,
            OutboundAction::Event(CoordinatorEvent::NodeRegistered { reconnect: true, .. })
        )));
    }

    #[test]
    fn operator_commands_need_a_session() {
        let (_dir, mut c) = coordinator();
        assert!(matches!(
            c.arm(0),
            Err(CoordinatorError::Session(SessionError::NoSession))
        ));
        assert!(c.add_stimulus("x", 0).is_err());
        let actions = c.create_session("pilot", 0).unwrap();
        assert!(actions.iter().any(|a| matches!(
            a,
            OutboundAction::Event(CoordinatorEvent::SessionStateChanged {
                to: SessionState::Configuring,
                ..
            })
        )));
    }

    #[test]
    fn arm_timeout_raises_create_failure() {
        let (_dir, mut c) = coordinator();
        c.create_session("pilot", 0).unwrap();
        let actions = c.tick(300_001);
        assert!(faults(&actions)
            .iter()
            .any(|f| matches!(f, Fault::SessionCreateFailure { .. })));
        assert_eq!(c.session_state(), SessionState::Aborted);
    }
}
