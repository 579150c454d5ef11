use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::{oneshot, watch};

use crate::capability::{
    Capability, ClientHook, Pipeline, PipelineHook, Promise, RemotePromise, Response,
};
use crate::error::{Result, RpcError};
use crate::message::PipelineOp;
use crate::payload::Payload;

struct QueuedCall {
    interface_id: u64,
    method_id: u16,
    params: Payload,
    response: oneshot::Sender<Promise<Response>>,
    pipeline: Arc<QueuedPipeline>,
}

impl QueuedCall {
    fn deliver(self, target: Result<Capability>) {
        match target {
            Ok(cap) => {
                let RemotePromise { response, pipeline } =
                    cap.call(self.interface_id, self.method_id, self.params);
                self.pipeline.resolve(Ok(pipeline));
                let _ = self.response.send(response);
            }
            Err(error) => {
                self.pipeline.resolve(Err(error.clone()));
                let _ = self
                    .response
                    .send(futures::future::ready(Err(error)).boxed());
            }
        }
    }
}

#[derive(Default)]
struct QueueState {
    target: Option<Result<Capability>>,
    /// Set while queued calls are being handed to `target`. New calls keep
    /// queueing until the backlog is empty so none can overtake an older one.
    draining: bool,
    queue: VecDeque<QueuedCall>,
}

/// A local promise for a capability. Calls are buffered in arrival order and
/// delivered once the target is known.
pub struct QueuedClient {
    state: Mutex<QueueState>,
    resolved: watch::Sender<Option<Result<Capability>>>,
}

impl QueuedClient {
    pub fn new() -> Self {
        let (resolved, _) = watch::channel(None);
        Self {
            state: Mutex::new(QueueState::default()),
            resolved,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle the promise. Only the first resolution counts.
    pub fn resolve(&self, target: Result<Capability>) {
        {
            let mut state = self.lock();
            if state.target.is_some() {
                return;
            }
            state.target = Some(target.clone());
            state.draining = true;
        }

        loop {
            let (call, target) = {
                let mut state = self.lock();
                match state.queue.pop_front() {
                    Some(call) => (call, target.clone()),
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };
            call.deliver(target);
        }

        self.resolved.send_replace(Some(target));
    }

    pub fn is_resolved(&self) -> bool {
        let state = self.lock();
        state.target.is_some() && !state.draining
    }
}

impl Default for QueuedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHook for QueuedClient {
    fn call(&self, interface_id: u64, method_id: u16, params: Payload) -> RemotePromise {
        let target = {
            let mut state = self.lock();
            let ready = if state.draining {
                None
            } else {
                state.target.clone()
            };
            match ready {
                Some(target) => target,
                None => {
                    let (tx, rx) = oneshot::channel();
                    let pipeline = Arc::new(QueuedPipeline::new());
                    state.queue.push_back(QueuedCall {
                        interface_id,
                        method_id,
                        params,
                        response: tx,
                        pipeline: pipeline.clone(),
                    });
                    let response = async move {
                        match rx.await {
                            Ok(response) => response.await,
                            Err(_) => Err(RpcError::failed("Queued call was dropped")),
                        }
                    };
                    return RemotePromise {
                        response: response.boxed(),
                        pipeline: Pipeline::new(pipeline),
                    };
                }
            }
        };

        match target {
            Ok(cap) => cap.call(interface_id, method_id, params),
            Err(error) => RemotePromise::broken(error),
        }
    }

    fn get_resolved(&self) -> Option<Capability> {
        let state = self.lock();
        if state.draining {
            return None;
        }
        match &state.target {
            Some(Ok(cap)) => Some(cap.clone()),
            Some(Err(error)) => Some(Capability::broken(error.clone())),
            None => None,
        }
    }

    fn when_more_resolved(&self) -> Option<Promise<Capability>> {
        if self.is_resolved() {
            return None;
        }
        let mut rx = self.resolved.subscribe();
        Some(
            async move {
                let settled = rx
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| RpcError::failed("Promise was dropped"))?;
                match settled.as_ref() {
                    Some(result) => result.clone(),
                    None => Err(RpcError::failed("Promise was dropped")),
                }
            }
            .boxed(),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct PipelineState {
    resolution: Option<Result<Pipeline>>,
    /// Promises handed out before resolution, kept so every holder of a path
    /// shares one ordering domain.
    clients: HashMap<Vec<PipelineOp>, Arc<QueuedClient>>,
}

/// Pipeline for results that are not available yet.
pub struct QueuedPipeline {
    state: Mutex<PipelineState>,
}

impl QueuedPipeline {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PipelineState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn resolve(&self, resolution: Result<Pipeline>) {
        let waiting: Vec<_> = {
            let mut state = self.lock();
            if state.resolution.is_some() {
                return;
            }
            state.resolution = Some(resolution.clone());
            state
                .clients
                .iter()
                .map(|(ops, client)| (ops.clone(), client.clone()))
                .collect()
        };

        for (ops, client) in waiting {
            let target = match &resolution {
                Ok(pipeline) => Ok(pipeline.get_pipelined_cap(&ops)),
                Err(error) => Err(error.clone()),
            };
            client.resolve(target);
        }
    }
}

impl Default for QueuedPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHook for QueuedPipeline {
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Capability {
        let resolved = {
            let mut state = self.lock();
            if let Some(client) = state.clients.get(ops) {
                return Capability::new(client.clone());
            }
            match &state.resolution {
                Some(resolution) => resolution.clone(),
                None => {
                    let client = Arc::new(QueuedClient::new());
                    state.clients.insert(ops.to_vec(), client.clone());
                    return Capability::new(client);
                }
            }
        };

        match resolved {
            Ok(pipeline) => pipeline.get_pipelined_cap(ops),
            Err(error) => Capability::broken(error),
        }
    }
}
