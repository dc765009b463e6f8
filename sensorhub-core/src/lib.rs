//! Sensor session coordinator core.
//! Host-driven: no I/O sockets; the host passes events and receives actions.

pub mod aggregation;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod identity;
pub mod integrity;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod store;
pub mod wire;

pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, OutboundAction};
pub use error::CoordinatorError;
pub use events::{CoordinatorEvent, Fault};
pub use identity::{Handshake, Keypair, PublicKey};
pub use protocol::{Message, Payload, PROTOCOL_VERSION};
pub use registry::{Capability, ConnectionState, Role};
pub use session::{Session, SessionState};
pub use store::SessionStore;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
