use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::sync::oneshot;

use crate::capability::{
    ClientHook, Dispatch, Pipeline, Promise, RemotePromise, Request, Response,
};
use crate::error::{Result, RpcError};
use crate::payload::Payload;
use crate::queued::QueuedPipeline;

/// What a server method produces.
pub enum Reply {
    Results(Payload),
    /// Hand the call off to another capability; its results become ours.
    TailCall(Request),
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Results(payload) => f.debug_tuple("Results").field(payload).finish(),
            Reply::TailCall(request) => f.debug_tuple("TailCall").field(request).finish(),
        }
    }
}

/// An object that can be wrapped in a `Capability`.
///
/// `dispatch` is invoked synchronously when the call is delivered, so any state
/// it touches before returning its promise observes calls in the order they were made.
pub trait Server: Send + Sync + 'static {
    fn dispatch(&self, interface_id: u64, method_id: u16, params: Payload) -> Promise<Reply>;

    /// Whether the method is a streaming call. While a streaming call is in
    /// flight, later calls to the same capability are held back until it settles.
    fn is_streaming(&self, _interface_id: u64, _method_id: u16) -> bool {
        false
    }
}

/// Completed reply carrying `payload`.
pub fn results(payload: Payload) -> Promise<Reply> {
    futures::future::ready(Ok(Reply::Results(payload))).boxed()
}

pub fn tail_call(request: Request) -> Promise<Reply> {
    futures::future::ready(Ok(Reply::TailCall(request))).boxed()
}

pub fn unimplemented_method(interface_id: u64, method_id: u16) -> RpcError {
    RpcError::unimplemented(format!(
        "Method not implemented: {:#x}.{}",
        interface_id, method_id
    ))
}

pub type Handler<S> = fn(&S, Payload) -> Promise<Reply>;

struct Method<S> {
    handler: Handler<S>,
    streaming: bool,
}

/// Dispatch table keyed by `(interface_id, method_id)`.
pub struct MethodTable<S> {
    name: &'static str,
    methods: HashMap<(u64, u16), Method<S>>,
}

impl<S> MethodTable<S> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            methods: HashMap::new(),
        }
    }

    pub fn method(mut self, interface_id: u64, method_id: u16, handler: Handler<S>) -> Self {
        let method = Method {
            handler,
            streaming: false,
        };
        self.methods.insert((interface_id, method_id), method);
        self
    }

    /// Register a streaming method. See [`Server::is_streaming`].
    pub fn streaming(mut self, interface_id: u64, method_id: u16, handler: Handler<S>) -> Self {
        let method = Method {
            handler,
            streaming: true,
        };
        self.methods.insert((interface_id, method_id), method);
        self
    }

    pub fn is_streaming(&self, interface_id: u64, method_id: u16) -> bool {
        self.methods
            .get(&(interface_id, method_id))
            .is_some_and(|method| method.streaming)
    }

    pub fn dispatch(
        &self,
        server: &S,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> Promise<Reply> {
        match self.methods.get(&(interface_id, method_id)) {
            Some(method) => (method.handler)(server, params),
            None => {
                tracing::debug!(
                    server = self.name,
                    interface_id,
                    method_id,
                    "unimplemented method"
                );
                futures::future::ready(Err(unimplemented_method(interface_id, method_id))).boxed()
            }
        }
    }
}

impl<S> fmt::Debug for MethodTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .finish()
    }
}

/// Capability backed by a server object in this process.
pub struct LocalClient {
    server: Arc<dyn Server>,
    ptr: usize,
    gate: Arc<Mutex<CallGate>>,
}

/// Calls held back behind an in-flight streaming call.
#[derive(Default)]
struct CallGate {
    blocked: bool,
    broken: Option<RpcError>,
    held: VecDeque<Held>,
}

enum Held {
    Call {
        interface_id: u64,
        method_id: u16,
        params: Payload,
        reply: oneshot::Sender<Promise<Reply>>,
    },
    Idle(oneshot::Sender<()>),
}

fn lock(gate: &Mutex<CallGate>) -> std::sync::MutexGuard<'_, CallGate> {
    gate.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalClient {
    pub fn new<S: Server>(server: Arc<S>) -> Self {
        let ptr = Arc::as_ptr(&server) as *const () as usize;
        Self {
            server,
            ptr,
            gate: Arc::new(Mutex::new(CallGate::default())),
        }
    }

    /// Completes once no streaming call is in flight and every held call has been delivered.
    pub async fn idle(&self) {
        let waiter = {
            let mut gate = lock(&self.gate);
            if !gate.blocked {
                return;
            }
            let (tx, rx) = oneshot::channel();
            gate.held.push_back(Held::Idle(tx));
            rx
        };
        let _ = waiter.await;
    }

    fn start(&self, interface_id: u64, method_id: u16, params: Payload) -> Promise<Reply> {
        let mut gate = lock(&self.gate);
        if let Some(error) = &gate.broken {
            return futures::future::ready(Err(error.clone())).boxed();
        }
        if gate.blocked {
            let (tx, rx) = oneshot::channel();
            gate.held.push_back(Held::Call {
                interface_id,
                method_id,
                params,
                reply: tx,
            });
            return async move {
                match rx.await {
                    Ok(reply) => reply.await,
                    Err(_) => Err(RpcError::failed("Server went away with the call still held")),
                }
            }
            .boxed();
        }

        let streaming = self.server.is_streaming(interface_id, method_id);
        gate.blocked = streaming;
        drop(gate);

        let reply = self.server.dispatch(interface_id, method_id, params);
        if streaming {
            hold_gate(self.gate.clone(), self.server.clone(), reply)
        } else {
            reply
        }
    }
}

/// Keeps the gate closed until the streaming reply settles or is dropped.
struct StreamingGuard {
    gate: Arc<Mutex<CallGate>>,
    server: Arc<dyn Server>,
}

impl Drop for StreamingGuard {
    fn drop(&mut self) {
        release_held(&self.gate, &self.server);
    }
}

fn hold_gate(
    gate: Arc<Mutex<CallGate>>,
    server: Arc<dyn Server>,
    reply: Promise<Reply>,
) -> Promise<Reply> {
    let guard = StreamingGuard { gate, server };
    async move {
        let result = reply.await;
        if let Err(error) = &result {
            tracing::debug!("Streaming call failed, server is now broken: {}", error);
            lock(&guard.gate).broken = Some(error.clone());
        }
        drop(guard);
        result
    }
    .boxed()
}

/// Deliver held calls in order until the queue drains or another streaming call starts.
fn release_held(gate: &Arc<Mutex<CallGate>>, server: &Arc<dyn Server>) {
    loop {
        let mut state = lock(gate);
        // The gate stays closed while draining so new calls queue behind older ones.
        let Some(held) = state.held.pop_front() else {
            state.blocked = false;
            return;
        };
        let (interface_id, method_id, params, reply) = match held {
            Held::Idle(waiter) => {
                let _ = waiter.send(());
                continue;
            }
            Held::Call {
                interface_id,
                method_id,
                params,
                reply,
            } => (interface_id, method_id, params, reply),
        };
        if let Some(error) = &state.broken {
            let error = error.clone();
            drop(state);
            let _ = reply.send(futures::future::ready(Err(error)).boxed());
            continue;
        }
        let streaming = server.is_streaming(interface_id, method_id);
        drop(state);

        let promise = server.dispatch(interface_id, method_id, params);
        if streaming {
            let _ = reply.send(hold_gate(gate.clone(), server.clone(), promise));
            return;
        }
        let _ = reply.send(promise);
    }
}

impl ClientHook for LocalClient {
    fn call(&self, interface_id: u64, method_id: u16, params: Payload) -> RemotePromise {
        remote_promise_from_reply(self.start(interface_id, method_id, params))
    }

    fn dispatch(&self, interface_id: u64, method_id: u16, params: Payload) -> Dispatch {
        Dispatch::Local(self.start(interface_id, method_id, params))
    }

    fn server_ptr(&self) -> Option<usize> {
        Some(self.ptr)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Adapt a server reply into a response plus a pipeline.
///
/// Tail calls are followed here: the pipeline switches to the tail call's
/// pipeline as soon as it is issued.
pub fn remote_promise_from_reply(reply: Promise<Reply>) -> RemotePromise {
    let pipeline = Arc::new(QueuedPipeline::new());
    let resolver = pipeline.clone();

    let response = async move {
        match reply.await {
            Ok(Reply::Results(payload)) => {
                let response = Response::new(payload);
                resolver.resolve(Ok(response.pipeline()));
                Ok(response)
            }
            Ok(Reply::TailCall(request)) => {
                let RemotePromise { response, pipeline } = request.send();
                resolver.resolve(Ok(pipeline));
                response.await
            }
            Err(error) => {
                resolver.resolve(Err(error.clone()));
                Err(error)
            }
        }
    }
    .boxed()
    .shared();

    // Drive the reply even if only the pipeline is used.
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(response.clone().map(|_: Result<Response>| ()));
    }

    RemotePromise {
        response: response.boxed(),
        pipeline: Pipeline::new(pipeline),
    }
}
