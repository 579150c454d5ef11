use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use capnrpc_core::{
    Capability, ClientHook, ImportId, Payload, Pipeline, PipelineHook, PipelineOp, Promise,
    QuestionId, RemotePromise, Response, Result, RpcError,
};
use futures::FutureExt;
use tokio::sync::{oneshot, watch};

use crate::connection::{Command, ConnectionHandle, OutgoingCall};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where an outgoing question stands, as seen from the application side.
#[derive(Clone)]
pub(crate) enum QuestionSlot {
    /// Handed to the connection but not yet assigned an id.
    Unsent,
    Sent(QuestionId),
    /// The call never went on the wire; pipelined calls follow this pipeline instead.
    Redirected(Pipeline),
    Failed(RpcError),
}

#[derive(Default)]
struct PipelineState {
    resolution: Option<Result<Pipeline>>,
    /// Promise clients handed out before the results arrived.
    clients: HashMap<Vec<PipelineOp>, Weak<RpcClient>>,
}

/// Application-side handle on one question.
///
/// Held by the response future, the pipeline, and every pipelined capability.
/// Dropping the last holder tells the connection to send `Finish`.
pub(crate) struct QuestionRef {
    conn: ConnectionHandle,
    slot: Mutex<QuestionSlot>,
    pipeline: Mutex<PipelineState>,
}

impl QuestionRef {
    pub(crate) fn new(conn: ConnectionHandle) -> Arc<Self> {
        Arc::new(Self {
            conn,
            slot: Mutex::new(QuestionSlot::Unsent),
            pipeline: Mutex::new(PipelineState::default()),
        })
    }

    pub(crate) fn slot(&self) -> QuestionSlot {
        lock(&self.slot).clone()
    }

    pub(crate) fn set_sent(&self, id: QuestionId) {
        *lock(&self.slot) = QuestionSlot::Sent(id);
    }

    pub(crate) fn redirect(&self, pipeline: Pipeline) {
        *lock(&self.slot) = QuestionSlot::Redirected(pipeline);
    }

    pub(crate) fn fail(&self, error: RpcError) {
        *lock(&self.slot) = QuestionSlot::Failed(error);
    }

    /// Record the final pipeline and hand back the promise clients created
    /// before it was known. Only the first resolution counts.
    pub(crate) fn resolve_pipeline(
        &self,
        resolution: Result<Pipeline>,
    ) -> Vec<(Vec<PipelineOp>, Arc<RpcClient>)> {
        let mut state = lock(&self.pipeline);
        if state.resolution.is_some() {
            return Vec::new();
        }
        state.resolution = Some(resolution);
        state
            .clients
            .drain()
            .filter_map(|(ops, client)| client.upgrade().map(|client| (ops, client)))
            .collect()
    }

    fn pipelined_cap(self: &Arc<Self>, ops: &[PipelineOp]) -> Capability {
        let mut state = lock(&self.pipeline);
        if let Some(resolution) = state.resolution.clone() {
            drop(state);
            return match resolution {
                Ok(pipeline) => pipeline.get_pipelined_cap(ops),
                Err(error) => Capability::broken(error),
            };
        }

        if let Some(client) = state.clients.get(ops).and_then(Weak::upgrade) {
            return Capability::new(client);
        }
        state.clients.retain(|_, client| client.strong_count() > 0);

        let inner = Capability::new(Arc::new(RpcClient::new(
            self.conn.clone(),
            ClientKind::Pipeline(self.clone(), ops.to_vec()),
        )));
        let client = Arc::new(RpcClient::promise(self.conn.clone(), inner));
        state.clients.insert(ops.to_vec(), Arc::downgrade(&client));
        Capability::new(client)
    }
}

impl Drop for QuestionRef {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let QuestionSlot::Sent(id) = slot {
            let _ = self.conn.send(Command::QuestionDropped(*id));
        }
    }
}

/// Pipeline over the results of a question sent to the peer.
pub(crate) struct RpcPipeline {
    question: Arc<QuestionRef>,
}

impl RpcPipeline {
    pub(crate) fn new(question: Arc<QuestionRef>) -> Self {
        Self { question }
    }
}

impl PipelineHook for RpcPipeline {
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Capability {
        self.question.pipelined_cap(ops)
    }
}

/// Keeps an import alive. The last drop asks the connection to send `Release`.
pub(crate) struct ImportRef {
    conn: ConnectionHandle,
    pub(crate) id: ImportId,
    token: u64,
}

impl Drop for ImportRef {
    fn drop(&mut self) {
        let _ = self.conn.send(Command::ReleaseImport {
            id: self.id,
            token: self.token,
        });
    }
}

pub(crate) struct PromiseState {
    pub(crate) cap: Capability,
    pub(crate) resolved: bool,
    /// Set once a call or descriptor went through the promise before it resolved.
    pub(crate) received_call: bool,
}

/// A capability promise backed by the peer: an import promise or a pipelined result.
pub(crate) struct PromiseCell {
    state: Mutex<PromiseState>,
    settled: watch::Sender<bool>,
}

impl PromiseCell {
    fn new(initial: Capability) -> Self {
        Self {
            state: Mutex::new(PromiseState {
                cap: initial,
                resolved: false,
                received_call: false,
            }),
            settled: watch::channel(false).0,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PromiseState> {
        lock(&self.state)
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.lock().resolved
    }

    pub(crate) fn resolution(&self) -> Option<Capability> {
        let state = self.lock();
        state.resolved.then(|| state.cap.clone())
    }

    pub(crate) fn resolve(&self, cap: Capability) {
        let previous = {
            let mut state = self.lock();
            state.resolved = true;
            std::mem::replace(&mut state.cap, cap)
        };
        // Dropping the old target may enqueue a release; do it outside the lock.
        drop(previous);
        self.settled.send_replace(true);
    }

    async fn settled(&self) -> Result<Capability> {
        let mut settled = self.settled.subscribe();
        let _ = settled.wait_for(|settled| *settled).await;
        self.resolution()
            .ok_or_else(|| RpcError::disconnected("Promise abandoned before it resolved"))
    }
}

/// What an `RpcClient` points at on the peer.
#[derive(Clone)]
pub(crate) enum ClientKind {
    Import(Arc<ImportRef>),
    Pipeline(Arc<QuestionRef>, Vec<PipelineOp>),
    Promise(Arc<PromiseCell>),
}

/// Capability hosted by the peer at the other end of one connection.
///
/// Every call is handed to the connection task, which picks the wire target,
/// so calls on one reference reach the peer in the order they were made.
pub(crate) struct RpcClient {
    pub(crate) conn: ConnectionHandle,
    pub(crate) kind: ClientKind,
}

impl RpcClient {
    pub(crate) fn new(conn: ConnectionHandle, kind: ClientKind) -> Self {
        Self { conn, kind }
    }

    pub(crate) fn import(conn: ConnectionHandle, id: ImportId, token: u64) -> Self {
        let import = Arc::new(ImportRef {
            conn: conn.clone(),
            id,
            token,
        });
        Self::new(conn, ClientKind::Import(import))
    }

    pub(crate) fn promise(conn: ConnectionHandle, initial: Capability) -> Self {
        Self::new(conn, ClientKind::Promise(Arc::new(PromiseCell::new(initial))))
    }

    pub(crate) fn promise_cell(&self) -> Option<&Arc<PromiseCell>> {
        match &self.kind {
            ClientKind::Promise(cell) => Some(cell),
            _ => None,
        }
    }
}

impl ClientHook for RpcClient {
    fn call(&self, interface_id: u64, method_id: u16, params: Payload) -> RemotePromise {
        let question = QuestionRef::new(self.conn.clone());
        let (response_tx, response_rx) = oneshot::channel();
        let command = Command::Call(OutgoingCall {
            target: self.kind.clone(),
            interface_id,
            method_id,
            params,
            question: question.clone(),
            response: response_tx,
        });

        if let Err(command) = self.conn.send(command) {
            // The connection is gone. A promise that already settled elsewhere still works.
            if let (ClientKind::Promise(cell), Command::Call(call)) = (&self.kind, command) {
                if let Some(resolved) = cell.resolution() {
                    return resolved.call(interface_id, method_id, call.params);
                }
            }
            return RemotePromise::broken(RpcError::disconnected("Connection has been closed"));
        }

        question_promise(question, response_rx)
    }

    fn get_resolved(&self) -> Option<Capability> {
        self.promise_cell()?.resolution()
    }

    fn when_more_resolved(&self) -> Option<Promise<Capability>> {
        let cell = self.promise_cell()?;
        if cell.is_resolved() {
            return None;
        }
        let cell = cell.clone();
        Some(async move { cell.settled().await }.boxed())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Wrap a question handed to the connection into the application's view of it.
pub(crate) fn question_promise(
    question: Arc<QuestionRef>,
    response: oneshot::Receiver<Promise<Response>>,
) -> RemotePromise {
    let pipeline = Pipeline::new(Arc::new(RpcPipeline::new(question.clone())));
    let response = async move {
        let _question = question;
        match response.await {
            Ok(outcome) => outcome.await,
            Err(_) => Err(RpcError::disconnected(
                "Connection closed before the call returned",
            )),
        }
    }
    .boxed();

    RemotePromise { response, pipeline }
}
