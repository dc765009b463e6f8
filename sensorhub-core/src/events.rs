//! Observable coordinator events. Returned to the host as actions; the daemon fans them out
//! to subscribers over a broadcast channel.

use std::collections::BTreeSet;

use crate::protocol::SensorSample;
use crate::registry::{Capability, ConnectionState};
use crate::session::{FileRecord, SessionState, StimulusEvent};

/// Fault taxonomy surfaced to operators. Per-node faults never abort a session on their own.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Fault {
    #[error("malformed message from {device_id}: {reason}")]
    MalformedMessage { device_id: String, reason: String },
    #[error("message from unknown device {device_id}")]
    UnknownDevice { device_id: String },
    #[error("heartbeat timeout for {device_id}")]
    HeartbeatTimeout { device_id: String },
    #[error("sync quality lost for {device_id}")]
    SyncQualityDegraded { device_id: String, quality: f64 },
    #[error("start not acknowledged by {}", excluded.join(", "))]
    StartBroadcastPartialFailure {
        session_id: String,
        excluded: Vec<String>,
    },
    #[error("file {name} from {device_id}: declared {declared} bytes, received {received}")]
    FileTransferMismatch {
        device_id: String,
        name: String,
        declared: u64,
        received: u64,
    },
    #[error("session could not be created or armed: {reason}")]
    SessionCreateFailure { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    NodeRegistered {
        device_id: String,
        capabilities: BTreeSet<Capability>,
        reconnect: bool,
    },
    NodeStateChanged {
        device_id: String,
        from: ConnectionState,
        to: ConnectionState,
    },
    SyncUpdated {
        device_id: String,
        offset_ms: f64,
        rtt_ms: i64,
        quality: f64,
        accepted: bool,
    },
    SessionStateChanged {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },
    StimulusRecorded {
        session_id: String,
        event: StimulusEvent,
    },
    FileCommitted(FileRecord),
    /// Live samples, timestamps already in coordinator time.
    SensorData {
        device_id: String,
        samples: Vec<SensorSample>,
        synchronised: bool,
    },
    PreviewFrame {
        device_id: String,
        encoded_image: String,
    },
    Notification {
        device_id: String,
        timestamp: i64,
        label: String,
    },
    Fault(Fault),
}

impl From<Fault> for CoordinatorEvent {
    fn from(f: Fault) -> Self {
        CoordinatorEvent::Fault(f)
    }
}
