//! Wire protocol: message types exchanged between the coordinator and sensor nodes.

use serde::{Deserialize, Serialize};

use crate::registry::{Capability, Role};

/// Current protocol version. Used in the transport handshake and discovery beacon.
pub const PROTOCOL_VERSION: u8 = 1;

/// Device id the coordinator puts on every message it sends.
pub const COORDINATOR_ID: &str = "coordinator";

/// One decoded message. `timestamp` is the sender's local clock, ms since epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub timestamp: i64,
    pub device_id: String,
    pub body: Payload,
}

impl Message {
    pub fn new(device_id: impl Into<String>, timestamp: i64, body: Payload) -> Self {
        Self {
            timestamp,
            device_id: device_id.into(),
            body,
        }
    }

    /// Message sent by the coordinator.
    pub fn from_coordinator(timestamp: i64, body: Payload) -> Self {
        Self::new(COORDINATOR_ID, timestamp, body)
    }

    pub fn message_type(&self) -> &'static str {
        self.body.message_type()
    }
}

/// Closed set of message types. Serialized adjacently tagged so the wire codec can
/// split `message_type` from `payload` for checksumming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", content = "payload", rename_all = "snake_case")]
pub enum Payload {
    Hello(Hello),
    Status(Status),
    Sync(SyncPayload),
    Command(Command),
    Ack(Ack),
    FileInfo {
        name: String,
        size: u64,
    },
    FileChunk {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    FileEnd {
        name: String,
    },
    FileReceived(FileReceived),
    PreviewFrame {
        encoded_image: String,
    },
    SensorData {
        samples: Vec<SensorSample>,
    },
    Notification(Annotation),
    StimulusEvent(Annotation),
    /// Coordinator rejected a frame (checksum, parse, or state error).
    Nack {
        reason: String,
    },
    /// Discovery: coordinator advertises its transport endpoint over UDP multicast.
    Beacon {
        protocol_version: u8,
        public_key: String,
        listen_port: u16,
    },
}

impl Payload {
    pub fn message_type(&self) -> &'static str {
        match self {
            Payload::Hello(_) => "hello",
            Payload::Status(_) => "status",
            Payload::Sync(_) => "sync",
            Payload::Command(_) => "command",
            Payload::Ack(_) => "ack",
            Payload::FileInfo { .. } => "file_info",
            Payload::FileChunk { .. } => "file_chunk",
            Payload::FileEnd { .. } => "file_end",
            Payload::FileReceived(_) => "file_received",
            Payload::PreviewFrame { .. } => "preview_frame",
            Payload::SensorData { .. } => "sensor_data",
            Payload::Notification(_) => "notification",
            Payload::StimulusEvent(_) => "stimulus_event",
            Payload::Nack { .. } => "nack",
            Payload::Beacon { .. } => "beacon",
        }
    }
}

/// First message on every connection. Capabilities are validated by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub device_type: String,
    pub capabilities: Vec<String>,
    pub app_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub battery_level: u8,
    pub storage_free: u64,
    pub recording_state: String,
    /// Link quality reported by the node, 0-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_quality: Option<u8>,
}

/// Request (coordinator sets `master_timestamp`) or reply (node sets `node_timestamp`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_timestamp: Option<i64>,
    pub sync_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Begin local capture when the node's own clock reaches `scheduled_start_timestamp`.
    StartRecording {
        session_id: String,
        scheduled_start_timestamp: i64,
        recording_parameters: RecordingParameters,
    },
    StopRecording {
        session_id: String,
    },
    /// Stream every buffered file of the session, then ack `send_files` with `complete`.
    SendFiles {
        session_id: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartRecording { .. } => "start_recording",
            Command::StopRecording { .. } => "stop_recording",
            Command::SendFiles { .. } => "send_files",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingParameters {
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// `scheduled_start_timestamp` expressed in coordinator time.
    pub coordinator_start_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub cmd: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReceived {
    pub status: TransferStatus,
    pub name: String,
    pub received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub timestamp: i64,
    pub values: Vec<f64>,
}

/// Timestamped label used by `notification` and `stimulus_event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub timestamp: i64,
    pub label: String,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s: String = Deserialize::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
