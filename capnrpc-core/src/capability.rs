use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::broken::{BrokenClient, BrokenPipeline};
use crate::error::{Result, RpcError};
use crate::local::{LocalClient, Reply, Server};
use crate::message::PipelineOp;
use crate::payload::Payload;
use crate::queued::QueuedClient;
use crate::value::Value;

/// Boxed, sendable future used at every asynchronous seam.
pub type Promise<T> = BoxFuture<'static, Result<T>>;

/// How a hook began executing an inbound call.
pub enum Dispatch {
    /// The call reached a server object; the reply may still be a tail call.
    Local(Promise<Reply>),
    /// The call was forwarded elsewhere.
    Remote(RemotePromise),
}

/// The machinery behind a `Capability`.
///
/// Every variant of capability (local server, remote import, pipelined promise,
/// queued promise, broken, null) is a `ClientHook` implementation.
pub trait ClientHook: Send + Sync + 'static {
    /// Start a call. Must not block; the outcome is delivered through the returned promise.
    fn call(&self, interface_id: u64, method_id: u16, params: Payload) -> RemotePromise;

    /// Like `call`, but exposes a local server's reply so a connection can
    /// forward tail calls instead of proxying them.
    fn dispatch(&self, interface_id: u64, method_id: u16, params: Payload) -> Dispatch {
        Dispatch::Remote(self.call(interface_id, method_id, params))
    }

    /// If this is a promise that has already resolved, the capability it resolved to.
    fn get_resolved(&self) -> Option<Capability> {
        None
    }

    /// If this is an unresolved promise, a future for its next resolution step.
    fn when_more_resolved(&self) -> Option<Promise<Capability>> {
        None
    }

    /// The error a broken capability fails every call with.
    fn error(&self) -> Option<RpcError> {
        None
    }

    fn is_null(&self) -> bool {
        false
    }

    /// Address of the server object for locally hosted capabilities.
    fn server_ptr(&self) -> Option<usize> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Reference-counted handle to something callable.
#[derive(Clone)]
pub struct Capability {
    hook: Arc<dyn ClientHook>,
}

impl Capability {
    pub fn new(hook: Arc<dyn ClientHook>) -> Self {
        Self { hook }
    }

    pub fn from_server<S: Server>(server: S) -> Self {
        Self::from_arc(Arc::new(server))
    }

    pub fn from_arc<S: Server>(server: Arc<S>) -> Self {
        Self::new(Arc::new(LocalClient::new(server)))
    }

    pub fn broken(error: RpcError) -> Self {
        Self::new(Arc::new(BrokenClient::new(error, false)))
    }

    pub fn null() -> Self {
        Self::new(Arc::new(BrokenClient::new(
            RpcError::failed("Called null capability"),
            true,
        )))
    }

    /// A capability standing in for the eventual result of `promise`.
    ///
    /// Calls made before the promise settles are queued and delivered in order.
    pub fn from_promise(promise: Promise<Capability>) -> Self {
        let queued = Arc::new(QueuedClient::new());
        let resolver = queued.clone();
        let drive = async move {
            let result = promise.await;
            resolver.resolve(result);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(drive);
            }
            Err(_) => {
                queued.resolve(Err(RpcError::failed(
                    "Promised capability created outside of a runtime",
                )));
            }
        }
        Self::new(queued)
    }

    pub fn hook(&self) -> &Arc<dyn ClientHook> {
        &self.hook
    }

    pub fn call(&self, interface_id: u64, method_id: u16, params: Payload) -> RemotePromise {
        self.hook.call(interface_id, method_id, params)
    }

    pub fn new_call(&self, interface_id: u64, method_id: u16) -> Request {
        Request {
            target: self.clone(),
            interface_id,
            method_id,
            params: Payload::default(),
        }
    }

    /// The innermost capability this one is known to resolve to right now.
    pub fn resolved(&self) -> Capability {
        let mut current = self.clone();
        while let Some(next) = current.hook.get_resolved() {
            current = next;
        }
        current
    }

    /// Wait until this capability stops being a promise.
    ///
    /// Fails if it settles to a broken capability.
    pub async fn when_resolved(&self) -> Result<()> {
        let mut current = self.clone();
        loop {
            if let Some(next) = current.hook.get_resolved() {
                current = next;
                continue;
            }
            match current.hook.when_more_resolved() {
                Some(more) => current = more.await?,
                None => break,
            }
        }
        match current.hook.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Identity of the underlying hook.
    pub fn ptr(&self) -> usize {
        Arc::as_ptr(&self.hook) as *const () as usize
    }

    pub fn same_as(&self, other: &Capability) -> bool {
        self.ptr() == other.ptr()
    }

    pub fn downgrade(&self) -> WeakCapability {
        WeakCapability {
            hook: Arc::downgrade(&self.hook),
        }
    }

    /// Drop this reference now. Remote peers are notified once the last reference goes away.
    pub fn release(self) {}
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capability({:#x})", self.ptr())
    }
}

/// Non-owning reference, used by servers that need a capability to themselves.
#[derive(Clone)]
pub struct WeakCapability {
    hook: Weak<dyn ClientHook>,
}

impl WeakCapability {
    pub fn upgrade(&self) -> Option<Capability> {
        self.hook.upgrade().map(Capability::new)
    }
}

impl fmt::Debug for WeakCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakCapability(live: {})", self.hook.strong_count() > 0)
    }
}

/// A call that has been built but not yet sent.
pub struct Request {
    target: Capability,
    interface_id: u64,
    method_id: u16,
    params: Payload,
}

impl Request {
    pub fn params(&mut self) -> &mut Payload {
        &mut self.params
    }

    pub fn with_params(mut self, params: Payload) -> Self {
        self.params = params;
        self
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.params.content = content;
        self
    }

    pub fn target(&self) -> &Capability {
        &self.target
    }

    pub fn into_parts(self) -> (Capability, u64, u16, Payload) {
        (self.target, self.interface_id, self.method_id, self.params)
    }

    pub fn send(self) -> RemotePromise {
        self.target
            .call(self.interface_id, self.method_id, self.params)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("target", &self.target)
            .field("interface_id", &format_args!("{:#x}", self.interface_id))
            .field("method_id", &self.method_id)
            .finish()
    }
}

/// Outcome of a call: the eventual response plus a pipeline usable right away.
pub struct RemotePromise {
    pub response: Promise<Response>,
    pub pipeline: Pipeline,
}

impl RemotePromise {
    pub fn broken(error: RpcError) -> Self {
        Self {
            pipeline: Pipeline::broken(error.clone()),
            response: futures::future::ready(Err(error)).boxed(),
        }
    }
}

impl fmt::Debug for RemotePromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePromise").finish_non_exhaustive()
    }
}

/// Results of a completed call.
#[derive(Clone)]
pub struct Response {
    payload: Arc<Payload>,
}

impl Response {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload: Arc::new(payload),
        }
    }

    pub fn from_arc(payload: Arc<Payload>) -> Self {
        Self { payload }
    }

    pub fn content(&self) -> &Value {
        &self.payload.content
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn get_cap(&self, index: u32) -> Result<Capability> {
        self.payload.get_cap(index)
    }

    /// Capability at a pointer-field path, e.g. `&[1, 0]` for `outBox.cap`
    pub fn cap_at(&self, path: &[u16]) -> Result<Capability> {
        self.payload.cap_at(&PipelineOp::path(path))
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(Arc::new(PayloadPipeline {
            payload: self.payload.clone(),
        }))
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Response").field(&self.payload).finish()
    }
}

pub trait PipelineHook: Send + Sync + 'static {
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Capability;
}

/// Access to capabilities inside results that may not have arrived yet.
#[derive(Clone)]
pub struct Pipeline {
    hook: Arc<dyn PipelineHook>,
}

impl Pipeline {
    pub fn new(hook: Arc<dyn PipelineHook>) -> Self {
        Self { hook }
    }

    pub fn broken(error: RpcError) -> Self {
        Self::new(Arc::new(BrokenPipeline::new(error)))
    }

    pub fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Capability {
        self.hook.get_pipelined_cap(ops)
    }

    /// Promise for the capability at a pointer-field path
    pub fn get_cap(&self, path: &[u16]) -> Capability {
        self.hook.get_pipelined_cap(&PipelineOp::path(path))
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

/// Pipeline over results that are already known.
struct PayloadPipeline {
    payload: Arc<Payload>,
}

impl PipelineHook for PayloadPipeline {
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Capability {
        self.payload.cap_at(ops).unwrap_or_else(Capability::broken)
    }
}
