//! Device registry: identity, declared capabilities, live status and role of every node.
//!
//! Nodes are created by their first `hello` and stay in the registry across disconnects so
//! they can resume; only [`DeviceRegistry::remove`] or [`DeviceRegistry::reset`] forget them.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::protocol::{Hello, Status};

/// Sensing abilities a node may declare in its hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    VisualCamera,
    ThermalCamera,
    GsrSensor,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::VisualCamera => "visual_camera",
            Capability::ThermalCamera => "thermal_camera",
            Capability::GsrSensor => "gsr_sensor",
        }
    }
}

impl FromStr for Capability {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "visual_camera" => Ok(Capability::VisualCamera),
            "thermal_camera" => Ok(Capability::ThermalCamera),
            "gsr_sensor" => Ok(Capability::GsrSensor),
            other => Err(RegistryError::MalformedCapability(other.to_string())),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Channel open for a known node that has not re-sent hello yet.
    Attached,
    Registered,
    Active,
    /// Connected but sync quality is gone.
    Degraded,
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Attached => "attached",
            ConnectionState::Registered => "registered",
            ConnectionState::Active => "active",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    PrimaryRecorder,
    SecondaryRecorder,
    ReferenceSensor,
}

impl FromStr for Role {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary_recorder" | "primary" => Ok(Role::PrimaryRecorder),
            "secondary_recorder" | "secondary" => Ok(Role::SecondaryRecorder),
            "reference_sensor" | "reference" => Ok(Role::ReferenceSensor),
            other => Err(RegistryError::UnknownRole(other.to_string())),
        }
    }
}

/// One connected (or previously connected) sensor-bearing device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteNode {
    pub device_id: String,
    pub device_type: String,
    pub app_version: String,
    pub capabilities: BTreeSet<Capability>,
    pub state: ConnectionState,
    pub battery_level: Option<u8>,
    pub storage_free: Option<u64>,
    pub recording_state: Option<String>,
    pub connection_quality: Option<u8>,
    pub last_heartbeat: i64,
    pub role: Option<Role>,
    /// A status arrived since the last hello.
    pub status_since_hello: bool,
    /// Number of hellos received, i.e. 1 + reconnects.
    pub connections: u32,
}

/// Change notifications drained by the coordinator after each registry mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered {
        device_id: String,
        capabilities: BTreeSet<Capability>,
        reconnect: bool,
    },
    StateChanged {
        device_id: String,
        from: ConnectionState,
        to: ConnectionState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unrecognized capability {0:?}")]
    MalformedCapability(String),
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error("device {0} must send hello first")]
    HelloRequired(String),
    #[error("unknown role {0:?}")]
    UnknownRole(String),
}

pub struct DeviceRegistry {
    nodes: HashMap<String, RemoteNode>,
    heartbeat_timeout_ms: i64,
    events: Vec<RegistryEvent>,
}

impl DeviceRegistry {
    pub fn new(heartbeat_timeout_ms: i64) -> Self {
        Self {
            nodes: HashMap::new(),
            heartbeat_timeout_ms,
            events: Vec::new(),
        }
    }

    /// Register (or re-register) a node from its hello. Unknown capability names are rejected
    /// without touching an existing entry.
    pub fn register(
        &mut self,
        device_id: &str,
        hello: &Hello,
        now: i64,
    ) -> Result<&RemoteNode, RegistryError> {
        let capabilities = hello
            .capabilities
            .iter()
            .map(|c| c.parse::<Capability>())
            .collect::<Result<BTreeSet<_>, _>>()?;

        if let Some(node) = self.nodes.get_mut(device_id) {
            let from = node.state;
            node.device_type = hello.device_type.clone();
            node.app_version = hello.app_version.clone();
            node.capabilities = capabilities.clone();
            node.state = ConnectionState::Registered;
            node.status_since_hello = false;
            node.last_heartbeat = now;
            node.connections = node.connections.saturating_add(1);
            if from == ConnectionState::Disconnected || from == ConnectionState::Attached {
                self.events.push(RegistryEvent::Registered {
                    device_id: device_id.to_string(),
                    capabilities,
                    reconnect: true,
                });
            }
            if from != ConnectionState::Registered {
                self.events.push(RegistryEvent::StateChanged {
                    device_id: device_id.to_string(),
                    from,
                    to: ConnectionState::Registered,
                });
            }
        } else {
            self.events.push(RegistryEvent::Registered {
                device_id: device_id.to_string(),
                capabilities: capabilities.clone(),
                reconnect: false,
            });
            self.nodes.insert(
                device_id.to_string(),
                RemoteNode {
                    device_id: device_id.to_string(),
                    device_type: hello.device_type.clone(),
                    app_version: hello.app_version.clone(),
                    capabilities,
                    state: ConnectionState::Registered,
                    battery_level: None,
                    storage_free: None,
                    recording_state: None,
                    connection_quality: None,
                    last_heartbeat: now,
                    role: None,
                    status_since_hello: false,
                    connections: 1,
                },
            );
        }
        Ok(&self.nodes[device_id])
    }

    /// Merge a status report. The first status after hello makes the node active.
    pub fn update_status(
        &mut self,
        device_id: &str,
        status: &Status,
        now: i64,
    ) -> Result<(), RegistryError> {
        let node = self
            .nodes
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.to_string()))?;
        match node.state {
            ConnectionState::Disconnected => {
                return Err(RegistryError::NotConnected(device_id.to_string()))
            }
            ConnectionState::Attached => {
                return Err(RegistryError::HelloRequired(device_id.to_string()))
            }
            _ => {}
        }
        node.battery_level = Some(status.battery_level);
        node.storage_free = Some(status.storage_free);
        node.recording_state = Some(status.recording_state.clone());
        if status.connection_quality.is_some() {
            node.connection_quality = status.connection_quality;
        }
        node.status_since_hello = true;
        node.last_heartbeat = now;
        if node.state == ConnectionState::Registered {
            node.state = ConnectionState::Active;
            self.events.push(RegistryEvent::StateChanged {
                device_id: device_id.to_string(),
                from: ConnectionState::Registered,
                to: ConnectionState::Active,
            });
        }
        Ok(())
    }

    /// Refresh the heartbeat of a connected node. Returns false for unknown or disconnected ids.
    pub fn touch(&mut self, device_id: &str, now: i64) -> bool {
        match self.nodes.get_mut(device_id) {
            Some(node) if node.state.is_connected() => {
                node.last_heartbeat = node.last_heartbeat.max(now);
                true
            }
            _ => false,
        }
    }

    /// Transition every connected node whose heartbeat is older than the timeout to
    /// `disconnected`. Returns the ids that changed; a node is reported once per outage.
    pub fn mark_heartbeat_timeouts(&mut self, now: i64) -> Vec<String> {
        let mut timed_out: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.state.is_connected())
            .filter(|n| now.saturating_sub(n.last_heartbeat) > self.heartbeat_timeout_ms)
            .map(|n| n.device_id.clone())
            .collect();
        timed_out.sort();
        for id in &timed_out {
            self.set_state(id, ConnectionState::Disconnected);
        }
        timed_out
    }

    /// Channel opened for an id. Known disconnected nodes become `attached` until they hello.
    pub fn mark_attached(&mut self, device_id: &str, now: i64) -> bool {
        let Some(node) = self.nodes.get_mut(device_id) else {
            return false;
        };
        node.last_heartbeat = now;
        if node.state == ConnectionState::Disconnected {
            self.set_state(device_id, ConnectionState::Attached);
        }
        true
    }

    /// Channel closed. Returns true if the node was connected before.
    pub fn mark_disconnected(&mut self, device_id: &str) -> bool {
        match self.nodes.get(device_id) {
            Some(node) if node.state.is_connected() => {
                self.set_state(device_id, ConnectionState::Disconnected);
                true
            }
            _ => false,
        }
    }

    /// Sync quality lost. Only registered/active nodes degrade.
    pub fn mark_degraded(&mut self, device_id: &str) -> bool {
        match self.nodes.get(device_id).map(|n| n.state) {
            Some(ConnectionState::Registered) | Some(ConnectionState::Active) => {
                self.set_state(device_id, ConnectionState::Degraded);
                true
            }
            _ => false,
        }
    }

    /// Sync quality back. Degraded nodes return to active (or registered if no status yet).
    pub fn restore(&mut self, device_id: &str) -> bool {
        let Some(node) = self.nodes.get(device_id) else {
            return false;
        };
        if node.state != ConnectionState::Degraded {
            return false;
        }
        let to = if node.status_since_hello {
            ConnectionState::Active
        } else {
            ConnectionState::Registered
        };
        self.set_state(device_id, to);
        true
    }

    /// Used during session configuration; the node must be connected and registered.
    pub fn assign_role(&mut self, device_id: &str, role: Role) -> Result<(), RegistryError> {
        let node = self
            .nodes
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.to_string()))?;
        match node.state {
            ConnectionState::Disconnected | ConnectionState::Attached => {
                Err(RegistryError::NotConnected(device_id.to_string()))
            }
            _ => {
                node.role = Some(role);
                Ok(())
            }
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&RemoteNode> {
        self.nodes.get(device_id)
    }

    /// All nodes ordered by id.
    pub fn nodes(&self) -> Vec<&RemoteNode> {
        let mut out: Vec<&RemoteNode> = self.nodes.values().collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.nodes()
            .into_iter()
            .filter(|n| n.state.is_connected())
            .map(|n| n.device_id.clone())
            .collect()
    }

    /// Administrative removal. Returns the removed node.
    pub fn remove(&mut self, device_id: &str) -> Option<RemoteNode> {
        self.nodes.remove(device_id)
    }

    /// Administrative reset: forget every node.
    pub fn reset(&mut self) -> Vec<String> {
        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        self.nodes.clear();
        ids
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Take the change events accumulated since the last call.
    pub fn drain_events(&mut self) -> Vec<RegistryEvent> {
        std::mem::take(&mut self.events)
    }

    fn set_state(&mut self, device_id: &str, to: ConnectionState) {
        if let Some(node) = self.nodes.get_mut(device_id) {
            let from = node.state;
            if from == to {
                return;
            }
            node.state = to;
            self.events.push(RegistryEvent::StateChanged {
                device_id: device_id.to_string(),
                from,
                to,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(caps: &[&str]) -> Hello {
        Hello {
            device_type: "android".into(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            app_version: "1.0".into(),
        }
    }

    fn status() -> Status {
        Status {
            battery_level: 76,
            storage_free: 8_000_000_000,
            recording_state: "idle".into(),
            connection_quality: Some(90),
        }
    }

    #[test]
    fn hello_registers_single_entry() {
        let mut reg = DeviceRegistry::new(30_000);
        let node = reg.register("A", &hello(&["visual_camera"]), 0).unwrap();
        assert_eq!(node.state, ConnectionState::Registered);
        assert_eq!(reg.len(), 1);
        assert_eq!(
            reg.get("A").unwrap().capabilities,
            BTreeSet::from([Capability::VisualCamera])
        );
    }

    #[test]
    fn duplicate_hello_updates_capabilities_without_duplicate() {
        let mut reg = DeviceRegistry::new(30_000);
        reg.register("A", &hello(&["visual_camera"]), 0).unwrap();
        reg.register("A", &hello(&["visual_camera", "gsr_sensor"]), 10)
            .unwrap();
        assert_eq!(reg.len(), 1);
        let node = reg.get("A").unwrap();
        assert_eq!(node.state, ConnectionState::Registered);
        assert!(node.capabilities.contains(&Capability::GsrSensor));
        let registered = reg
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, RegistryEvent::Registered { .. }))
            .count();
        assert_eq!(registered, 1);
    }

    #[test]
    fn unknown_capability_is_malformed() {
        let mut reg = DeviceRegistry::new(30_000);
        let err = reg
            .register("A", &hello(&["visual_camera", "lidar"]), 0)
            .unwrap_err();
        assert_eq!(err, RegistryError::MalformedCapability("lidar".into()));
        assert!(reg.is_empty());
    }

    #[test]
    fn status_promotes_to_active() {
        let mut reg = DeviceRegistry::new(30_000);
        reg.register("A", &hello(&["gsr_sensor"]), 0).unwrap();
        reg.update_status("A", &status(), 5).unwrap();
        let node = reg.get("A").unwrap();
        assert_eq!(node.state, ConnectionState::Active);
        assert_eq!(node.battery_level, Some(76));
        assert_eq!(node.last_heartbeat, 5);
    }

    #[test]
    fn status_from_unknown_device_fails() {
        let mut reg = DeviceRegistry::new(30_000);
        assert_eq!(
            reg.update_status("ghost", &status(), 0),
            Err(RegistryError::UnknownDevice("ghost".into()))
        );
    }

    #[test]
    fn heartbeat_timeout_reported_exactly_once() {
        let mut reg = DeviceRegistry::new(30_000);
        reg.register("A", &hello(&["visual_camera"]), 0).unwrap();
        reg.update_status("A", &status(), 0).unwrap();
        reg.drain_events();

        assert!(reg.mark_heartbeat_timeouts(30_000).is_empty());
        assert_eq!(reg.mark_heartbeat_timeouts(30_001), vec!["A".to_string()]);
        assert!(reg.mark_heartbeat_timeouts(60_000).is_empty());
        assert!(reg.mark_heartbeat_timeouts(90_000).is_empty());
        assert_eq!(reg.get("A").unwrap().state, ConnectionState::Disconnected);
        assert_eq!(reg.drain_events().len(), 1);
    }

    #[test]
    fn touch_prevents_timeout() {
        let mut reg = DeviceRegistry::new(30_000);
        reg.register("A", &hello(&["visual_camera"]), 0).unwrap();
        for t in (10_000..=100_000).step_by(10_000) {
            assert!(reg.touch("A", t));
            assert!(reg.mark_heartbeat_timeouts(t).is_empty());
        }
    }

    #[test]
    fn disconnected_node_kept_and_reconnects() {
        let mut reg = DeviceRegistry::new(30_000);
        reg.register("A", &hello(&["visual_camera"]), 0).unwrap();
        assert!(reg.mark_disconnected("A"));
        assert!(!reg.mark_disconnected("A"));
        assert_eq!(reg.len(), 1);
        assert!(!reg.touch("A", 5));

        assert!(reg.mark_attached("A", 10));
        assert_eq!(reg.get("A").unwrap().state, ConnectionState::Attached);
        assert_eq!(
            reg.update_status("A", &status(), 11),
            Err(RegistryError::HelloRequired("A".into()))
        );
        reg.drain_events();
        reg.register("A", &hello(&["visual_camera"]), 12).unwrap();
        let node = reg.get("A").unwrap();
        assert_eq!(node.connections, 2);
        assert!(reg
            .drain_events()
            .iter()
            .any(|e| matches!(e, RegistryEvent::Registered { reconnect: true, .. })));
    }

    #[test]
    fn assign_role_requires_connection() {
        let mut reg = DeviceRegistry::new(30_000);
        assert!(matches!(
            reg.assign_role("A", Role::PrimaryRecorder),
            Err(RegistryError::UnknownDevice(_))
        ));
        reg.register("A", &hello(&["visual_camera"]), 0).unwrap();
        reg.assign_role("A", Role::PrimaryRecorder).unwrap();
        assert_eq!(reg.get("A").unwrap().role, Some(Role::PrimaryRecorder));
        reg.mark_disconnected("A");
        assert_eq!(
            reg.assign_role("A", Role::SecondaryRecorder),
            Err(RegistryError::NotConnected("A".into()))
        );
    }

    #[test]
    fn degrade_and_restore() {
        let mut reg = DeviceRegistry::new(30_000);
        reg.register("A", &hello(&["thermal_camera"]), 0).unwrap();
        reg.update_status("A", &status(), 0).unwrap();
        assert!(reg.mark_degraded("A"));
        assert_eq!(reg.get("A").unwrap().state, ConnectionState::Degraded);
        assert!(reg.restore("A"));
        assert_eq!(reg.get("A").unwrap().state, ConnectionState::Active);
    }

    #[test]
    fn reset_forgets_everything() {
        let mut reg = DeviceRegistry::new(30_000);
        reg.register("A", &hello(&[]), 0).unwrap();
        reg.register("B", &hello(&["gsr_sensor"]), 0).unwrap();
        assert_eq!(reg.connected_ids(), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(reg.reset().len(), 2);
        assert!(reg.is_empty());
    }

    #[test]
    fn role_parses_short_names() {
        assert_eq!("primary".parse::<Role>().unwrap(), Role::PrimaryRecorder);
        assert_eq!(
            "reference_sensor".parse::<Role>().unwrap(),
            Role::ReferenceSensor
        );
        assert!("boss".parse::<Role>().is_err());
    }
}
