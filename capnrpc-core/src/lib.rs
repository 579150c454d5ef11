pub mod broken;
pub mod capability;
pub mod error;
pub mod local;
pub mod message;
pub mod payload;
pub mod queued;
pub mod server_set;
pub mod tables;
pub mod value;

pub use capability::{
    Capability, ClientHook, Dispatch, Pipeline, PipelineHook, Promise, RemotePromise, Request,
    Response, WeakCapability,
};
pub use error::{ErrorKind, Result, RpcError};
pub use local::{results, tail_call, unimplemented_method, MethodTable, Reply, Server};
pub use message::{
    AnswerId, CapDescriptor, EmbargoId, ExportId, ImportId, Message, MessageError, MessageTarget,
    PipelineOp, PromisedAnswer, QuestionId, WirePayload,
};
pub use payload::Payload;
pub use queued::{QueuedClient, QueuedPipeline};
pub use server_set::CapabilityServerSet;
pub use tables::{ExportTable, ImportTable, TableError};
pub use value::Value;
