//! Operation kinds and scalar parameter types of the control protocol

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result code the service uses to acknowledge success
pub const OPERATION_SUCCESS: i64 = 0;

/// Kinds reported back through `StreamListener::on_operation_handled`.
///
/// The first six are acks for a control request the client is blocked on;
/// the rest are unsolicited notices that only wake buffer waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Start,
    Pause,
    Stop,
    Flush,
    Drain,
    Release,
    UpdateStream,
    BufferUnderrun,
    BufferOverflow,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Pause => "pause",
            Operation::Stop => "stop",
            Operation::Flush => "flush",
            Operation::Drain => "drain",
            Operation::Release => "release",
            Operation::UpdateStream => "update_stream",
            Operation::BufferUnderrun => "buffer_underrun",
            Operation::BufferOverflow => "buffer_overflow",
        }
    }

    /// Notices never complete a pending request
    pub fn is_notice(self) -> bool {
        matches!(
            self,
            Operation::UpdateStream | Operation::BufferUnderrun | Operation::BufferOverflow
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side render rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RenderRate {
    #[default]
    Normal,
    Double,
    Half,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioEffectMode {
    None,
    #[default]
    Default,
}

/// Whether other apps may capture this stream's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PrivacyType {
    #[default]
    Public,
    Private,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_classification() {
        for op in [
            Operation::Start,
            Operation::Pause,
            Operation::Stop,
            Operation::Flush,
            Operation::Drain,
            Operation::Release,
        ] {
            assert!(!op.is_notice(), "{op}");
        }
        assert!(Operation::UpdateStream.is_notice());
        assert!(Operation::BufferUnderrun.is_notice());
        assert!(Operation::BufferOverflow.is_notice());
    }
}
