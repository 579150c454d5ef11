use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::RpcError;
use crate::value::Value;

/// Id of an outbound call, chosen by the caller.
pub type QuestionId = u32;
/// Id of an inbound call: the peer's `QuestionId`.
pub type AnswerId = u32;
/// Id of a capability this side exposes, chosen by the exporter.
pub type ExportId = u32;
/// Id of a capability the peer exposes: the peer's `ExportId`.
pub type ImportId = u32;
pub type EmbargoId = u32;

/// Protocol envelopes.
///
/// Encoded as a single-key JSON object: `{"call": {...}}`. Unknown keys decode to
/// `Unrecognized` so the receiver can answer with `Unimplemented` instead of failing.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Unimplemented(Box<Message>),
    Abort(RpcError),
    Bootstrap(Bootstrap),
    Call(Call),
    Return(Return),
    Finish(Finish),
    Resolve(Resolve),
    Release(Release),
    Disembargo(Disembargo),
    Unrecognized(JsonValue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    pub question_id: QuestionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub question_id: QuestionId,
    pub target: MessageTarget,
    pub interface_id: u64,
    pub method_id: u16,
    pub params: WirePayload,
    #[serde(default)]
    pub send_results_to: SendResultsTo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SendResultsTo {
    #[default]
    Caller,
    /// Keep the results; the caller will collect them with `takeFromOtherQuestion`.
    Yourself,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageTarget {
    ImportedCap(ImportId),
    PromisedAnswer(PromisedAnswer),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromisedAnswer {
    pub question_id: QuestionId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transform: Vec<PipelineOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineOp {
    Noop,
    GetPointerField(u16),
}

impl PipelineOp {
    pub fn path(fields: &[u16]) -> Vec<PipelineOp> {
        fields.iter().copied().map(PipelineOp::GetPointerField).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePayload {
    pub content: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_table: Vec<CapDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CapDescriptor {
    None,
    SenderHosted(ExportId),
    SenderPromise(ExportId),
    ReceiverHosted(ImportId),
    ReceiverAnswer(PromisedAnswer),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Return {
    pub answer_id: AnswerId,
    #[serde(default)]
    pub release_param_caps: bool,
    pub result: ReturnResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReturnResult {
    Results(WirePayload),
    Exception(RpcError),
    Canceled,
    ResultsSentElsewhere,
    TakeFromOtherQuestion(QuestionId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finish {
    pub question_id: QuestionId,
    pub release_result_caps: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolve {
    pub promise_id: ExportId,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    Cap(CapDescriptor),
    Exception(RpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub id: ImportId,
    pub reference_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disembargo {
    pub target: MessageTarget,
    pub context: DisembargoContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisembargoContext {
    SenderLoopback(EmbargoId),
    ReceiverLoopback(EmbargoId),
}

impl Message {
    /// Parse a message from a JSON value
    pub fn from_json(value: &JsonValue) -> Result<Self, MessageError> {
        let obj = value.as_object().ok_or(MessageError::NotAnObject)?;

        let mut entries = obj.iter();
        let (kind, body) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            (None, _) => return Err(MessageError::EmptyMessage),
            (Some(_), Some(_)) => return Err(MessageError::AmbiguousKind),
        };

        fn body_of<T: serde::de::DeserializeOwned>(
            kind: &str,
            body: &JsonValue,
        ) -> Result<T, MessageError> {
            serde_json::from_value(body.clone()).map_err(|e| MessageError::InvalidBody {
                kind: kind.to_string(),
                reason: e.to_string(),
            })
        }

        let message = match kind.as_str() {
            "unimplemented" => Message::Unimplemented(Box::new(Message::from_json(body)?)),
            "abort" => Message::Abort(body_of(kind, body)?),
            "bootstrap" => Message::Bootstrap(body_of(kind, body)?),
            "call" => Message::Call(body_of(kind, body)?),
            "return" => Message::Return(body_of(kind, body)?),
            "finish" => Message::Finish(body_of(kind, body)?),
            "resolve" => Message::Resolve(body_of(kind, body)?),
            "release" => Message::Release(body_of(kind, body)?),
            "disembargo" => Message::Disembargo(body_of(kind, body)?),
            _ => Message::Unrecognized(value.clone()),
        };
        Ok(message)
    }

    /// Convert the message to a JSON value
    pub fn to_json(&self) -> JsonValue {
        match self {
            Message::Unimplemented(inner) => serde_json::json!({ "unimplemented": inner.to_json() }),
            Message::Abort(err) => serde_json::json!({ "abort": err }),
            Message::Bootstrap(body) => serde_json::json!({ "bootstrap": body }),
            Message::Call(body) => serde_json::json!({ "call": body }),
            Message::Return(body) => serde_json::json!({ "return": body }),
            Message::Finish(body) => serde_json::json!({ "finish": body }),
            Message::Resolve(body) => serde_json::json!({ "resolve": body }),
            Message::Release(body) => serde_json::json!({ "release": body }),
            Message::Disembargo(body) => serde_json::json!({ "disembargo": body }),
            Message::Unrecognized(raw) => raw.clone(),
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Unimplemented(_) => "UNIMPLEMENTED",
            Message::Abort(_) => "ABORT",
            Message::Bootstrap(_) => "BOOTSTRAP",
            Message::Call(_) => "CALL",
            Message::Return(_) => "RETURN",
            Message::Finish(_) => "FINISH",
            Message::Resolve(_) => "RESOLVE",
            Message::Release(_) => "RELEASE",
            Message::Disembargo(_) => "DISEMBARGO",
            Message::Unrecognized(_) => "UNRECOGNIZED",
        }
    }
}

/// Custom serialization for Message
impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

/// Custom deserialization for Message
impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = JsonValue::deserialize(deserializer)?;
        Message::from_json(&value).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Message must be a JSON object")]
    NotAnObject,

    #[error("Message object cannot be empty")]
    EmptyMessage,

    #[error("Message object must have exactly one kind key")]
    AmbiguousKind,

    #[error("Invalid {kind} message: {reason}")]
    InvalidBody { kind: String, reason: String },
}
