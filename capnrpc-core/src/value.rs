use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};
use crate::message::PipelineOp;

/// Decoded content of a call's parameters or results.
///
/// Structs are positional: field `n` is the `n`th pointer field, which is what
/// `PipelineOp::GetPointerField` indexes. Capabilities are stored out of line in
/// the payload's capability table and referenced here by index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Data(Vec<u8>),
    List(Vec<Value>),
    Struct(Vec<Value>),
    Capability(u32),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn structure(fields: impl IntoIterator<Item = Value>) -> Self {
        Value::Struct(fields.into_iter().collect())
    }

    /// Pointer field `index` of a struct. Missing fields read as `Null`.
    pub fn field(&self, index: usize) -> &Value {
        const NULL: &Value = &Value::Null;
        match self {
            Value::Struct(fields) => fields.get(index).unwrap_or(NULL),
            _ => NULL,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_capability(&self) -> Option<u32> {
        match self {
            Value::Capability(index) => Some(*index),
            _ => None,
        }
    }

    /// Walks a pipeline transform and returns the capability table index found at the end.
    ///
    /// `Ok(None)` means the path ends in a null pointer, which denotes a null capability.
    pub fn follow(&self, ops: &[PipelineOp]) -> Result<Option<u32>> {
        let mut current = self;
        for op in ops {
            match op {
                PipelineOp::Noop => {}
                PipelineOp::GetPointerField(index) => match current {
                    Value::Struct(_) => current = current.field(*index as usize),
                    Value::Null => return Ok(None),
                    other => {
                        return Err(RpcError::failed(format!(
                            "Invalid pipeline transform: field {} of non-struct value {}",
                            index,
                            other.kind_name()
                        )))
                    }
                },
            }
        }

        match current {
            Value::Capability(index) => Ok(Some(*index)),
            Value::Null => Ok(None),
            other => Err(RpcError::failed(format!(
                "Invalid pipeline transform: path ends at {} instead of a capability",
                other.kind_name()
            ))),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Data(_) => "data",
            Value::List(_) => "list",
            Value::Struct(_) => "struct",
            Value::Capability(_) => "capability",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
