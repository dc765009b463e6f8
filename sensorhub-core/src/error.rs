use crate::aggregation::AggregationError;
use crate::registry::RegistryError;
use crate::session::SessionError;
use crate::store::StoreError;
use crate::wire::{FrameDecodeError, FrameEncodeError};

/// Error returned by coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Decode(#[from] FrameDecodeError),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("device id mismatch: channel {channel}, message {message}")]
    DeviceMismatch { channel: String, message: String },
}
