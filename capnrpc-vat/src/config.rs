use serde::Deserialize;

use capnrpc_transport::DEFAULT_MAX_FRAME_SIZE;

/// Per-connection limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Largest envelope accepted or produced by stream transports, in bytes.
    pub max_frame_size: usize,
    /// Outstanding questions allowed per connection before new calls fail with `Overloaded`.
    pub max_questions: usize,
    /// Log full envelope bodies at trace level.
    pub trace_messages: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_questions: 65_536,
            trace_messages: false,
        }
    }
}
