use std::any::Any;

use crate::capability::{Capability, ClientHook, PipelineHook, RemotePromise};
use crate::error::RpcError;
use crate::message::PipelineOp;
use crate::payload::Payload;

/// Capability whose every call fails with the same error. Also used for null.
pub struct BrokenClient {
    error: RpcError,
    is_null: bool,
}

impl BrokenClient {
    pub fn new(error: RpcError, is_null: bool) -> Self {
        Self { error, is_null }
    }
}

impl ClientHook for BrokenClient {
    fn call(&self, _interface_id: u64, _method_id: u16, _params: Payload) -> RemotePromise {
        RemotePromise::broken(self.error.clone())
    }

    fn error(&self) -> Option<RpcError> {
        if self.is_null {
            None
        } else {
            Some(self.error.clone())
        }
    }

    fn is_null(&self) -> bool {
        self.is_null
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct BrokenPipeline {
    error: RpcError,
}

impl BrokenPipeline {
    pub fn new(error: RpcError) -> Self {
        Self { error }
    }
}

impl PipelineHook for BrokenPipeline {
    fn get_pipelined_cap(&self, _ops: &[PipelineOp]) -> Capability {
        Capability::broken(self.error.clone())
    }
}
