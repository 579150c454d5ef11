use std::fmt;

use crate::capability::Capability;
use crate::error::{Result, RpcError};
use crate::message::PipelineOp;
use crate::value::Value;

/// Parameters or results of a call: a value tree plus the capabilities it references.
#[derive(Clone, Default)]
pub struct Payload {
    pub content: Value,
    /// Capability table. `None` entries are null capabilities.
    pub caps: Vec<Option<Capability>>,
}

impl Payload {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            caps: Vec::new(),
        }
    }

    /// Append a capability to the table and return the value that refers to it
    pub fn add_cap(&mut self, cap: Capability) -> Value {
        self.caps.push(Some(cap));
        Value::Capability((self.caps.len() - 1) as u32)
    }

    pub fn get_cap(&self, index: u32) -> Result<Capability> {
        match self.caps.get(index as usize) {
            Some(Some(cap)) => Ok(cap.clone()),
            Some(None) => Ok(Capability::null()),
            None => Err(RpcError::failed(format!(
                "Capability index {} out of range (table has {} entries)",
                index,
                self.caps.len()
            ))),
        }
    }

    /// Resolve a pipeline transform against the content
    pub fn cap_at(&self, ops: &[PipelineOp]) -> Result<Capability> {
        match self.content.follow(ops)? {
            Some(index) => self.get_cap(index),
            None => Ok(Capability::null()),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("content", &self.content)
            .field("caps", &self.caps.len())
            .finish()
    }
}
