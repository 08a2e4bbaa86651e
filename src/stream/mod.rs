//! Renderer and capturer stream clients

mod callbacks;
mod core;
mod position;
mod pull;
mod state;

pub mod capturer;
pub mod renderer;

pub use callbacks::{
    CallbackTable, PeriodPositionCallback, PositionCallback, ReadCallback, StreamCallback,
    WriteCallback,
};
pub use capturer::CapturerInClient;
pub use self::core::AudioTimestamp;
pub use position::{PositionEvents, PositionTracker};
pub use pull::{BufferDesc, BufferQueueState, CaptureMode, RenderMode};
pub use renderer::RendererInClient;
pub use state::{StateCell, StateChangeReason, StreamState};
