//! Control channel to the audio service
//!
//! Lifecycle requests are one-way; the service reports completion through a
//! registered [`StreamListener`] as `(operation, result)`. The client side
//! correlates acks with waiting callers through [`PendingOperations`].

#[cfg(feature = "loopback")]
pub mod loopback;
pub mod pending;
pub mod protocol;
pub mod service;
pub mod wire;

pub use pending::{PendingOperations, PendingTicket};
pub use protocol::{AudioEffectMode, Operation, PrivacyType, RenderRate, OPERATION_SUCCESS};
pub use service::{
    AudioService, IpcStream, ServiceConnector, ServiceRegistry, StreamHandle, StreamListener,
};
