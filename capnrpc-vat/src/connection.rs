use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use capnrpc_core::message::{
    Bootstrap, Call, Disembargo, DisembargoContext, Finish, Release, Resolution, Resolve, Return,
    ReturnResult, SendResultsTo,
};
use capnrpc_core::{
    AnswerId, CapDescriptor, Capability, Dispatch, EmbargoId, ExportId, ExportTable, ImportId,
    ImportTable, Message, MessageTarget, Payload, Pipeline, Promise, PromisedAnswer, QuestionId,
    QueuedClient, QueuedPipeline, Reply, Request, Response, Result, RpcError, TableError, Value,
    WirePayload,
};
use capnrpc_transport::{Transport, TransportError};
use futures::future::{self, AbortHandle, Abortable, Shared};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn, Instrument};

use crate::client::{question_promise, ClientKind, QuestionRef, QuestionSlot, RpcClient, RpcPipeline};
use crate::config::RpcConfig;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Disconnecting,
    Closed,
}

/// Table sizes of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub questions: usize,
    pub answers: usize,
    pub exports: usize,
    pub imports: usize,
    pub embargoes: usize,
}

/// Envelope contents that contradict the connection's tables. Any of these aborts the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid question ID {0} in Return")]
    UnknownQuestion(QuestionId),

    #[error("Duplicate Return for question {0}")]
    DuplicateReturn(QuestionId),

    #[error("Question ID {0} is already in use")]
    DuplicateQuestion(AnswerId),

    #[error("Unknown answer ID {0}")]
    UnknownAnswer(AnswerId),

    #[error("Unknown export ID {0}")]
    UnknownExport(ExportId),

    #[error("Invalid embargo ID {0}")]
    UnknownEmbargo(EmbargoId),

    #[error("Capability index {index} out of range (table has {len} entries)")]
    CapIndexOutOfRange { index: u32, len: usize },

    #[error("{0}")]
    InvalidTransform(String),

    #[error("{0}")]
    Invalid(&'static str),
}

impl From<TableError> for ProtocolError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::DuplicateId(id) => ProtocolError::DuplicateQuestion(id),
            TableError::UnknownId(id) => ProtocolError::UnknownAnswer(id),
        }
    }
}

impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        RpcError::unsupported(err.to_string())
    }
}

/// Work for a connection task.
pub(crate) enum Command {
    Inbound(Message),
    TransportClosed(Option<TransportError>),
    Call(OutgoingCall),
    Bootstrap {
        question: Arc<QuestionRef>,
        response: oneshot::Sender<Promise<Response>>,
    },
    QuestionDropped(QuestionId),
    ReleaseImport {
        id: ImportId,
        token: u64,
    },
    AnswerReady {
        answer_id: AnswerId,
        outcome: AnswerOutcome,
    },
    ExportResolved {
        export_id: ExportId,
        serial: u64,
        result: Result<Capability>,
    },
    DisembargoEcho {
        target: Capability,
        embargo_id: EmbargoId,
    },
    ResolvePipeline {
        question: Weak<QuestionRef>,
        result: Result<Pipeline>,
    },
    Stats(oneshot::Sender<ConnectionStats>),
    Disconnect(RpcError),
}

pub(crate) struct OutgoingCall {
    pub(crate) target: ClientKind,
    pub(crate) interface_id: u64,
    pub(crate) method_id: u16,
    pub(crate) params: Payload,
    pub(crate) question: Arc<QuestionRef>,
    pub(crate) response: oneshot::Sender<Promise<Response>>,
}

pub(crate) enum AnswerOutcome {
    Results(Payload),
    TailCall(Request),
    Exception(RpcError),
}

/// Cloneable handle to a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub(crate) id: u64,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.status() == ConnectionStatus::Active
    }

    pub(crate) fn send(&self, command: Command) -> std::result::Result<(), Command> {
        self.commands.send(command).map_err(|err| err.0)
    }

    /// The peer's bootstrap capability. Usable immediately; calls are pipelined
    /// on the outstanding `Bootstrap` question.
    pub fn bootstrap(&self) -> Capability {
        let question = QuestionRef::new(self.clone());
        let (response_tx, response_rx) = oneshot::channel();
        let command = Command::Bootstrap {
            question: question.clone(),
            response: response_tx,
        };
        if self.send(command).is_err() {
            return Capability::broken(RpcError::disconnected("Connection has been closed"));
        }
        question_promise(question, response_rx).pipeline.get_cap(&[])
    }

    /// Current table sizes, or `None` once the connection has closed.
    pub async fn stats(&self) -> Option<ConnectionStats> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx)).ok()?;
        rx.await.ok()
    }

    /// Abort the connection locally. The peer receives `Abort` with `reason`.
    pub fn disconnect(&self, reason: RpcError) {
        let _ = self.send(Command::Disconnect(reason));
    }

    /// Completes once the connection has fully closed.
    pub async fn on_disconnect(&self) {
        let mut status = self.status.clone();
        let _ = status
            .wait_for(|status| *status == ConnectionStatus::Closed)
            .await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Start the task that owns one connection and return a handle to it.
pub fn spawn_connection(
    peer: &str,
    transport: Arc<dyn Transport>,
    bootstrap: Option<Capability>,
    config: RpcConfig,
) -> ConnectionHandle {
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let (commands, receiver) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Active);
    let handle = ConnectionHandle {
        id,
        commands,
        status: status_rx,
    };

    let span = tracing::info_span!("rpc_connection", id, peer = %peer);
    let reader = tokio::spawn(
        read_loop(transport.clone(), handle.commands.clone()).instrument(span.clone()),
    );
    let state = ConnectionState {
        id,
        handle: handle.clone(),
        transport,
        config,
        bootstrap,
        questions: ExportTable::new(),
        answers: ImportTable::new(),
        exports: ExportTable::new(),
        exports_by_cap: HashMap::new(),
        imports: ImportTable::new(),
        embargoes: ExportTable::new(),
        next_import_token: 0,
        next_export_serial: 0,
        status: ConnectionStatus::Active,
        status_tx,
        reader: reader.abort_handle(),
    };
    tokio::spawn(state.run(receiver).instrument(span));
    handle
}

async fn read_loop(transport: Arc<dyn Transport>, commands: mpsc::UnboundedSender<Command>) {
    loop {
        let command = match transport.receive().await {
            Ok(Some(message)) => Command::Inbound(message),
            Ok(None) => Command::TransportClosed(None),
            Err(e) => Command::TransportClosed(Some(e)),
        };
        let done = matches!(command, Command::TransportClosed(_));
        if commands.send(command).is_err() || done {
            break;
        }
    }
}

struct Question {
    response: Option<oneshot::Sender<Promise<Response>>>,
    question_ref: Weak<QuestionRef>,
    /// Exports created for the call's parameters, released if the peer sets `releaseParamCaps`.
    param_exports: Vec<ExportId>,
    awaiting_return: bool,
    /// `Finish` already sent.
    finished: bool,
    is_tail_call: bool,
}

struct Answer {
    /// Still computing; a `Finish` now cancels it.
    active: bool,
    pipeline: Option<Pipeline>,
    results: Option<Arc<Payload>>,
    resolver: Option<Arc<QueuedPipeline>>,
    task: Option<AbortHandle>,
    /// Present when the caller asked us to keep the results (`sendResultsTo.yourself`).
    redirect: Option<oneshot::Sender<Result<Response>>>,
    redirected_results: Option<Shared<Promise<Response>>>,
    result_exports: Vec<ExportId>,
}

impl Answer {
    fn new(pipeline: Pipeline) -> Self {
        Self {
            active: false,
            pipeline: Some(pipeline),
            results: None,
            resolver: None,
            task: None,
            redirect: None,
            redirected_results: None,
            result_exports: Vec::new(),
        }
    }
}

impl Drop for Answer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Export {
    cap: Capability,
    refcount: u32,
    /// Matches the pending resolution task, if any.
    serial: u64,
    resolve_task: Option<AbortHandle>,
}

impl Drop for Export {
    fn drop(&mut self) {
        if let Some(task) = self.resolve_task.take() {
            task.abort();
        }
    }
}

struct Import {
    /// Number of times the peer has sent us this capability.
    remote_ref_count: u32,
    /// Distinguishes the live client from a dropped one whose release is still queued.
    token: u64,
    client: Weak<RpcClient>,
    promise: Weak<RpcClient>,
}

struct Embargo {
    queued: Arc<QueuedClient>,
    target: Capability,
}

/// How an outgoing call reaches its target.
enum CallRoute {
    Wire(MessageTarget),
    Local(Capability),
}

/// The `RpcClient` behind `cap` if it belongs to connection `connection_id`.
fn own_client(connection_id: u64, cap: &Capability) -> Option<&RpcClient> {
    cap.hook()
        .as_any()
        .downcast_ref::<RpcClient>()
        .filter(|client| client.conn.id == connection_id)
}

fn check_cap_indices(value: &Value, len: usize) -> std::result::Result<(), ProtocolError> {
    match value {
        Value::Capability(index) if *index as usize >= len => {
            Err(ProtocolError::CapIndexOutOfRange { index: *index, len })
        }
        Value::List(items) | Value::Struct(items) => items
            .iter()
            .try_for_each(|item| check_cap_indices(item, len)),
        _ => Ok(()),
    }
}

fn ready<T: Send + 'static>(result: Result<T>) -> Promise<T> {
    future::ready(result).boxed()
}

struct ConnectionState {
    id: u64,
    handle: ConnectionHandle,
    transport: Arc<dyn Transport>,
    config: RpcConfig,
    bootstrap: Option<Capability>,
    questions: ExportTable<Question>,
    answers: ImportTable<Answer>,
    exports: ExportTable<Export>,
    exports_by_cap: HashMap<usize, ExportId>,
    imports: ImportTable<Import>,
    embargoes: ExportTable<Embargo>,
    next_import_token: u64,
    next_export_serial: u64,
    status: ConnectionStatus,
    status_tx: watch::Sender<ConnectionStatus>,
    reader: tokio::task::AbortHandle,
}

impl ConnectionState {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("Connection established");
        while let Some(command) = commands.recv().await {
            self.handle_command(command);
            if self.status != ConnectionStatus::Active {
                break;
            }
        }

        self.reader.abort();
        // Calls still queued fail with Disconnected when their senders drop.
        drop(commands);
        self.transport.shutdown().await;
        self.status = ConnectionStatus::Closed;
        self.status_tx.send_replace(ConnectionStatus::Closed);
        info!("Connection closed");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Inbound(message) => {
                if let Err(e) = self.handle_message(message) {
                    warn!("Protocol error from peer: {}", e);
                    self.disconnect(e.into(), true);
                }
            }
            Command::TransportClosed(None) => {
                self.disconnect(RpcError::disconnected("Peer disconnected"), false);
            }
            Command::TransportClosed(Some(e)) if e.is_malformed_frame() => {
                warn!("Malformed envelope from peer: {}", e);
                self.disconnect(RpcError::unsupported(e.to_string()), true);
            }
            Command::TransportClosed(Some(e)) => {
                warn!("Transport failed: {}", e);
                self.disconnect(e.into(), false);
            }
            Command::Call(call) => self.send_call(call),
            Command::Bootstrap { question, response } => self.send_bootstrap(question, response),
            Command::QuestionDropped(id) => self.finish_question(id),
            Command::ReleaseImport { id, token } => self.release_import(id, token),
            Command::AnswerReady { answer_id, outcome } => self.answer_ready(answer_id, outcome),
            Command::ExportResolved {
                export_id,
                serial,
                result,
            } => self.resolve_exported_promise(export_id, serial, result),
            Command::DisembargoEcho { target, embargo_id } => {
                if let Err(e) = self.echo_disembargo(target, embargo_id) {
                    warn!("Protocol error from peer: {}", e);
                    self.disconnect(e.into(), true);
                }
            }
            Command::ResolvePipeline { question, result } => {
                if let Some(question) = question.upgrade() {
                    self.resolve_question_pipeline(&question, result);
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Disconnect(reason) => self.disconnect(reason, true),
        }
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            questions: self.questions.len(),
            answers: self.answers.len(),
            exports: self.exports.len(),
            imports: self.imports.len(),
            embargoes: self.embargoes.len(),
        }
    }

    fn send(&mut self, message: Message) {
        debug!("> {}", message.kind());
        if self.config.trace_messages {
            trace!(body = %message.to_json(), "> {}", message.kind());
        }
        if let Err(e) = self.transport.send(message) {
            debug!("Dropped outgoing message: {}", e);
        }
    }

    // ---- Outgoing questions ----

    /// Work out where a call on `kind` goes right now.
    fn route(&self, kind: ClientKind) -> CallRoute {
        let mut kind = kind;
        loop {
            let next = match &kind {
                ClientKind::Import(import) => {
                    return CallRoute::Wire(MessageTarget::ImportedCap(import.id))
                }
                ClientKind::Pipeline(question, ops) => match question.slot() {
                    QuestionSlot::Sent(question_id) => {
                        return CallRoute::Wire(MessageTarget::PromisedAnswer(PromisedAnswer {
                            question_id,
                            transform: ops.clone(),
                        }))
                    }
                    QuestionSlot::Redirected(pipeline) => pipeline.get_pipelined_cap(ops),
                    QuestionSlot::Failed(error) => Capability::broken(error),
                    QuestionSlot::Unsent => Capability::broken(RpcError::failed(
                        "Pipelined on a question that was never sent",
                    )),
                },
                ClientKind::Promise(cell) => {
                    let mut state = cell.lock();
                    if !state.resolved {
                        state.received_call = true;
                    }
                    state.cap.clone()
                }
            };
            match own_client(self.id, &next) {
                Some(client) => kind = client.kind.clone(),
                None => return CallRoute::Local(next),
            }
        }
    }

    fn send_call(&mut self, call: OutgoingCall) {
        let OutgoingCall {
            target,
            interface_id,
            method_id,
            params,
            question,
            response,
        } = call;

        match self.route(target) {
            CallRoute::Wire(target) => self.send_question(
                target,
                interface_id,
                method_id,
                params,
                question,
                response,
                SendResultsTo::Caller,
            ),
            CallRoute::Local(cap) => {
                let remote = cap.call(interface_id, method_id, params);
                question.redirect(remote.pipeline.clone());
                self.resolve_question_pipeline(&question, Ok(remote.pipeline));
                let _ = response.send(remote.response);
            }
        }
    }

    fn reject_question(
        &mut self,
        question: &Arc<QuestionRef>,
        response: oneshot::Sender<Promise<Response>>,
        error: RpcError,
    ) {
        question.fail(error.clone());
        self.resolve_question_pipeline(question, Err(error.clone()));
        let _ = response.send(ready(Err(error)));
    }

    fn overloaded(&self) -> Option<RpcError> {
        (self.questions.len() >= self.config.max_questions).then(|| {
            RpcError::overloaded(format!(
                "Too many outstanding questions ({})",
                self.questions.len()
            ))
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn send_question(
        &mut self,
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        params: Payload,
        question: Arc<QuestionRef>,
        response: oneshot::Sender<Promise<Response>>,
        send_results_to: SendResultsTo,
    ) {
        if let Some(error) = self.overloaded() {
            warn!("{}", error);
            self.reject_question(&question, response, error);
            return;
        }

        let (cap_table, param_exports) = self.write_descriptors(&params.caps);
        let question_id = self.questions.next(Question {
            response: Some(response),
            question_ref: Arc::downgrade(&question),
            param_exports,
            awaiting_return: true,
            finished: false,
            is_tail_call: send_results_to == SendResultsTo::Yourself,
        });
        question.set_sent(question_id);

        debug!(question_id, interface_id, method_id, "Sending call");
        self.send(Message::Call(Call {
            question_id,
            target,
            interface_id,
            method_id,
            params: WirePayload {
                content: params.content,
                cap_table,
            },
            send_results_to,
        }));
    }

    fn send_bootstrap(
        &mut self,
        question: Arc<QuestionRef>,
        response: oneshot::Sender<Promise<Response>>,
    ) {
        if let Some(error) = self.overloaded() {
            self.reject_question(&question, response, error);
            return;
        }
        let question_id = self.questions.next(Question {
            response: Some(response),
            question_ref: Arc::downgrade(&question),
            param_exports: Vec::new(),
            awaiting_return: true,
            finished: false,
            is_tail_call: false,
        });
        question.set_sent(question_id);
        self.send(Message::Bootstrap(Bootstrap { question_id }));
    }

    /// The application dropped its last reference to a question.
    fn finish_question(&mut self, id: QuestionId) {
        let Some(question) = self.questions.find_mut(id) else {
            return;
        };
        if question.finished {
            return;
        }
        question.finished = true;
        // Results not yet received are released by the peer on our behalf.
        let release_result_caps = question.awaiting_return;
        if !question.awaiting_return {
            self.questions.erase(id);
        }
        self.send(Message::Finish(Finish {
            question_id: id,
            release_result_caps,
        }));
    }

    // ---- Inbound envelopes ----

    fn handle_message(&mut self, message: Message) -> std::result::Result<(), ProtocolError> {
        debug!("< {}", message.kind());
        if self.config.trace_messages {
            trace!(body = %message.to_json(), "< {}", message.kind());
        }

        match message {
            Message::Unimplemented(original) => self.handle_unimplemented(*original),
            Message::Abort(error) => {
                warn!("Peer aborted connection: {}", error);
                self.disconnect(
                    RpcError::disconnected(format!("Peer aborted: {}", error.reason)),
                    false,
                );
                Ok(())
            }
            Message::Bootstrap(bootstrap) => self.handle_bootstrap(bootstrap),
            Message::Call(call) => self.handle_call(call),
            Message::Return(ret) => self.handle_return(ret),
            Message::Finish(finish) => self.handle_finish(finish),
            Message::Resolve(resolve) => {
                self.handle_resolve(resolve);
                Ok(())
            }
            Message::Release(release) => self.release_export(release.id, release.reference_count),
            Message::Disembargo(disembargo) => self.handle_disembargo(disembargo),
            unrecognized @ Message::Unrecognized(_) => {
                self.send(Message::Unimplemented(Box::new(unrecognized)));
                Ok(())
            }
        }
    }

    fn handle_unimplemented(&mut self, original: Message) -> std::result::Result<(), ProtocolError> {
        match original {
            Message::Resolve(Resolve {
                resolution: Resolution::Cap(descriptor),
                ..
            }) => match descriptor {
                // The peer never saw the capability we resolved to.
                CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id) => {
                    self.release_export(id, 1)
                }
                _ => Ok(()),
            },
            Message::Resolve(_) => Ok(()),
            other => {
                warn!("Peer does not implement {}", other.kind());
                Ok(())
            }
        }
    }

    fn handle_bootstrap(&mut self, bootstrap: Bootstrap) -> std::result::Result<(), ProtocolError> {
        let answer_id = bootstrap.question_id;
        if self.answers.contains(answer_id) {
            return Err(ProtocolError::DuplicateQuestion(answer_id));
        }

        let Some(cap) = self.bootstrap.clone() else {
            let error = RpcError::failed("This vat does not expose a bootstrap interface");
            self.answers
                .put(answer_id, Answer::new(Pipeline::broken(error.clone())))?;
            self.send(Message::Return(Return {
                answer_id,
                release_param_caps: false,
                result: ReturnResult::Exception(error),
            }));
            return Ok(());
        };

        let mut payload = Payload::default();
        payload.content = payload.add_cap(cap);
        let (cap_table, result_exports) = self.write_descriptors(&payload.caps);
        let content = payload.content.clone();
        let payload = Arc::new(payload);

        let mut answer = Answer::new(Response::from_arc(payload.clone()).pipeline());
        answer.results = Some(payload);
        answer.result_exports = result_exports;
        self.answers.put(answer_id, answer)?;

        self.send(Message::Return(Return {
            answer_id,
            release_param_caps: false,
            result: ReturnResult::Results(WirePayload { content, cap_table }),
        }));
        Ok(())
    }

    fn handle_call(&mut self, call: Call) -> std::result::Result<(), ProtocolError> {
        let Call {
            question_id: answer_id,
            target,
            interface_id,
            method_id,
            params,
            send_results_to,
        } = call;

        if self.answers.contains(answer_id) {
            return Err(ProtocolError::DuplicateQuestion(answer_id));
        }
        let params = self.receive_payload(params)?;
        let cap = self.message_target_cap(&target)?;
        debug!(answer_id, interface_id, method_id, "Delivering call");

        let (work, pipeline, resolver) = match cap.hook().dispatch(interface_id, method_id, params)
        {
            Dispatch::Local(reply) => {
                let resolver = Arc::new(QueuedPipeline::new());
                (reply, Pipeline::new(resolver.clone()), Some(resolver))
            }
            Dispatch::Remote(remote) => {
                let reply = remote
                    .response
                    .map(|response| response.map(|response| Reply::Results(response.payload().clone())))
                    .boxed();
                (reply, remote.pipeline, None)
            }
        };

        let mut answer = Answer::new(pipeline);
        answer.active = true;
        answer.resolver = resolver;
        if send_results_to == SendResultsTo::Yourself {
            let (tx, rx) = oneshot::channel();
            answer.redirect = Some(tx);
            answer.redirected_results = Some(
                async move {
                    rx.await
                        .unwrap_or_else(|_| Err(RpcError::failed("Call was canceled")))
                }
                .boxed()
                .shared(),
            );
        }
        answer.task = Some(self.spawn_answer(answer_id, work));
        self.answers.put(answer_id, answer)?;
        Ok(())
    }

    fn spawn_answer(&self, answer_id: AnswerId, work: Promise<Reply>) -> AbortHandle {
        let commands = self.handle.commands.clone();
        let (abort, registration) = AbortHandle::new_pair();
        let task = async move {
            let outcome = match work.await {
                Ok(Reply::Results(payload)) => AnswerOutcome::Results(payload),
                Ok(Reply::TailCall(request)) => AnswerOutcome::TailCall(request),
                Err(error) => AnswerOutcome::Exception(error),
            };
            let _ = commands.send(Command::AnswerReady { answer_id, outcome });
        };
        tokio::spawn(Abortable::new(task, registration).in_current_span());
        abort
    }

    fn answer_ready(&mut self, answer_id: AnswerId, outcome: AnswerOutcome) {
        match self.answers.find(answer_id) {
            Some(answer) if answer.active => {}
            // Canceled by Finish in the meantime.
            _ => return,
        }
        match outcome {
            AnswerOutcome::Results(payload) => self.return_results(answer_id, payload),
            AnswerOutcome::Exception(error) => self.return_exception(answer_id, error),
            AnswerOutcome::TailCall(request) => self.return_tail_call(answer_id, request),
        }
    }

    fn return_results(&mut self, answer_id: AnswerId, payload: Payload) {
        let payload = Arc::new(payload);
        let response = Response::from_arc(payload.clone());
        let Some(answer) = self.answers.find_mut(answer_id) else {
            return;
        };
        answer.active = false;
        answer.task = None;
        let resolver = answer.resolver.take();
        let redirect = answer.redirect.take();
        if redirect.is_none() {
            answer.results = Some(payload.clone());
        }

        if let Some(resolver) = resolver {
            resolver.resolve(Ok(response.pipeline()));
        }

        let result = match redirect {
            Some(redirect) => {
                let _ = redirect.send(Ok(response));
                ReturnResult::ResultsSentElsewhere
            }
            None => {
                let (cap_table, result_exports) = self.write_descriptors(&payload.caps);
                if let Some(answer) = self.answers.find_mut(answer_id) {
                    answer.result_exports = result_exports;
                }
                ReturnResult::Results(WirePayload {
                    content: payload.content.clone(),
                    cap_table,
                })
            }
        };
        self.send(Message::Return(Return {
            answer_id,
            release_param_caps: false,
            result,
        }));
    }

    fn return_exception(&mut self, answer_id: AnswerId, error: RpcError) {
        let Some(answer) = self.answers.find_mut(answer_id) else {
            return;
        };
        answer.active = false;
        answer.task = None;
        if let Some(resolver) = answer.resolver.take() {
            resolver.resolve(Err(error.clone()));
        }
        let result = match answer.redirect.take() {
            Some(redirect) => {
                let _ = redirect.send(Err(error));
                ReturnResult::ResultsSentElsewhere
            }
            None => ReturnResult::Exception(error),
        };
        self.send(Message::Return(Return {
            answer_id,
            release_param_caps: false,
            result,
        }));
    }

    /// A local server finished by tail-calling `request`.
    ///
    /// When the new target lives on the caller's side the call is sent back with
    /// `sendResultsTo.yourself` and the caller is told to take the results from it,
    /// so the results never travel through this vat.
    fn return_tail_call(&mut self, answer_id: AnswerId, request: Request) {
        let (target, interface_id, method_id, params) = request.into_parts();
        let redirected = self
            .answers
            .find(answer_id)
            .is_some_and(|answer| answer.redirect.is_some());

        let own_kind = own_client(self.id, &target.resolved()).map(|client| client.kind.clone());
        let route = own_kind.map(|kind| self.route(kind));

        if let (Some(CallRoute::Wire(wire_target)), false) = (&route, redirected) {
            let question = QuestionRef::new(self.handle.clone());
            let (response_tx, _) = oneshot::channel();
            self.send_question(
                wire_target.clone(),
                interface_id,
                method_id,
                params,
                question.clone(),
                response_tx,
                SendResultsTo::Yourself,
            );
            match question.slot() {
                QuestionSlot::Sent(question_id) => {
                    let Some(answer) = self.answers.find_mut(answer_id) else {
                        return;
                    };
                    answer.active = false;
                    answer.task = None;
                    if let Some(resolver) = answer.resolver.take() {
                        resolver.resolve(Ok(Pipeline::new(Arc::new(RpcPipeline::new(question)))));
                    }
                    self.send(Message::Return(Return {
                        answer_id,
                        release_param_caps: false,
                        result: ReturnResult::TakeFromOtherQuestion(question_id),
                    }));
                }
                QuestionSlot::Failed(error) => self.return_exception(answer_id, error),
                _ => self.return_exception(
                    answer_id,
                    RpcError::failed("Tail call could not be forwarded"),
                ),
            }
            return;
        }

        // Otherwise proxy the call and forward its outcome.
        let remote = match route {
            Some(CallRoute::Local(cap)) => cap.call(interface_id, method_id, params),
            _ => target.call(interface_id, method_id, params),
        };
        if let Some(resolver) = self
            .answers
            .find_mut(answer_id)
            .and_then(|answer| answer.resolver.take())
        {
            resolver.resolve(Ok(remote.pipeline));
        }
        let work = remote
            .response
            .map(|response| response.map(|response| Reply::Results(response.payload().clone())))
            .boxed();
        let task = self.spawn_answer(answer_id, work);
        if let Some(answer) = self.answers.find_mut(answer_id) {
            answer.task = Some(task);
        }
    }

    fn handle_return(&mut self, ret: Return) -> std::result::Result<(), ProtocolError> {
        let Return {
            answer_id: question_id,
            release_param_caps,
            result,
        } = ret;

        let question = self
            .questions
            .find_mut(question_id)
            .ok_or(ProtocolError::UnknownQuestion(question_id))?;
        if !question.awaiting_return {
            return Err(ProtocolError::DuplicateReturn(question_id));
        }
        question.awaiting_return = false;

        let param_exports = if release_param_caps {
            std::mem::take(&mut question.param_exports)
        } else {
            Vec::new()
        };
        let is_tail_call = question.is_tail_call;
        let response = question.response.take();
        let question_ref = question.question_ref.upgrade();

        if question.finished {
            // Canceled earlier; `Finish` already asked the peer to drop the results.
            if let ReturnResult::TakeFromOtherQuestion(other) = result {
                if let Some(answer) = self.answers.find_mut(other) {
                    answer.redirected_results = None;
                }
            }
            self.questions.erase(question_id);
            return self.release_exports(&param_exports);
        }

        match result {
            ReturnResult::Results(wire) => {
                if is_tail_call {
                    return Err(ProtocolError::Invalid(
                        "Tail call Return must set resultsSentElsewhere, not results",
                    ));
                }
                let response_value = Response::new(self.receive_payload(wire)?);
                if let Some(question_ref) = &question_ref {
                    self.resolve_question_pipeline(question_ref, Ok(response_value.pipeline()));
                }
                if let Some(response) = response {
                    let _ = response.send(ready(Ok(response_value)));
                }
            }
            ReturnResult::Exception(error) => {
                if is_tail_call {
                    return Err(ProtocolError::Invalid(
                        "Tail call Return must set resultsSentElsewhere, not exception",
                    ));
                }
                if let Some(question_ref) = &question_ref {
                    self.resolve_question_pipeline(question_ref, Err(error.clone()));
                }
                if let Some(response) = response {
                    let _ = response.send(ready(Err(error)));
                }
            }
            ReturnResult::Canceled => {
                return Err(ProtocolError::Invalid(
                    "Return falsely claims the call was canceled",
                ));
            }
            ReturnResult::ResultsSentElsewhere => {
                if !is_tail_call {
                    return Err(ProtocolError::Invalid(
                        "Return had resultsSentElsewhere but this was not a tail call",
                    ));
                }
                // Pipelined calls keep going to the peer's answer; only the response is empty.
                if let Some(response) = response {
                    let _ = response.send(ready(Ok(Response::new(Payload::default()))));
                }
            }
            ReturnResult::TakeFromOtherQuestion(other) => {
                let answer = self
                    .answers
                    .find_mut(other)
                    .ok_or(ProtocolError::UnknownAnswer(other))?;
                let redirected = answer.redirected_results.take().ok_or(ProtocolError::Invalid(
                    "takeFromOtherQuestion referenced a call that did not use sendResultsTo.yourself",
                ))?;

                if let Some(question_ref) = &question_ref {
                    let question = Arc::downgrade(question_ref);
                    let commands = self.handle.commands.clone();
                    let results = redirected.clone();
                    tokio::spawn(
                        async move {
                            let result = results.await.map(|response| response.pipeline());
                            let _ = commands.send(Command::ResolvePipeline { question, result });
                        }
                        .in_current_span(),
                    );
                }
                if let Some(response) = response {
                    let _ = response.send(redirected.boxed());
                }
            }
        }

        self.release_exports(&param_exports)
    }

    fn handle_finish(&mut self, finish: Finish) -> std::result::Result<(), ProtocolError> {
        let Finish {
            question_id: answer_id,
            release_result_caps,
        } = finish;

        let answer = self
            .answers
            .find_mut(answer_id)
            .ok_or(ProtocolError::UnknownAnswer(answer_id))?;
        let result_exports = if release_result_caps {
            std::mem::take(&mut answer.result_exports)
        } else {
            Vec::new()
        };
        let canceled = answer.active;

        // Dropping the entry aborts a call still in progress.
        self.answers.erase(answer_id);
        if canceled {
            debug!(answer_id, "Call canceled by caller");
            self.send(Message::Return(Return {
                answer_id,
                release_param_caps: false,
                result: ReturnResult::Canceled,
            }));
        }
        self.release_exports(&result_exports)
    }

    fn handle_resolve(&mut self, resolve: Resolve) {
        let Resolve {
            promise_id,
            resolution,
        } = resolve;

        // Receive first so an unused capability is released again.
        let replacement = match resolution {
            Resolution::Cap(descriptor) => {
                self.receive_cap(descriptor).unwrap_or_else(Capability::null)
            }
            Resolution::Exception(error) => Capability::broken(error),
        };

        let promise = self
            .imports
            .find(promise_id)
            .and_then(|import| import.promise.upgrade());
        match promise {
            Some(promise) => self.resolve_promise(&promise, replacement),
            None => debug!(promise_id, "Ignoring Resolve for an unknown or non-promise import"),
        }
    }

    fn handle_disembargo(
        &mut self,
        disembargo: Disembargo,
    ) -> std::result::Result<(), ProtocolError> {
        match disembargo.context {
            DisembargoContext::SenderLoopback(embargo_id) => {
                let target = self.message_target_cap(&disembargo.target)?;
                // Echo behind every call already forwarded to the same target.
                let _ = self
                    .handle
                    .send(Command::DisembargoEcho { target, embargo_id });
                Ok(())
            }
            DisembargoContext::ReceiverLoopback(embargo_id) => {
                let embargo = self
                    .embargoes
                    .erase(embargo_id)
                    .ok_or(ProtocolError::UnknownEmbargo(embargo_id))?;
                debug!(embargo_id, "Embargo lifted");
                embargo.queued.resolve(Ok(embargo.target));
                Ok(())
            }
        }
    }

    fn echo_disembargo(
        &mut self,
        target: Capability,
        embargo_id: EmbargoId,
    ) -> std::result::Result<(), ProtocolError> {
        let target = target.resolved();
        let kind = own_client(self.id, &target)
            .map(|client| client.kind.clone())
            .ok_or(ProtocolError::Invalid(
                "senderLoopback Disembargo sent to an object that does not point back to the sender",
            ))?;
        match self.route(kind) {
            CallRoute::Wire(target) => {
                self.send(Message::Disembargo(Disembargo {
                    target,
                    context: DisembargoContext::ReceiverLoopback(embargo_id),
                }));
                Ok(())
            }
            CallRoute::Local(_) => Err(ProtocolError::Invalid(
                "senderLoopback Disembargo sent to an object that was never resolved to the sender",
            )),
        }
    }

    // ---- Capability tables ----

    fn message_target_cap(
        &self,
        target: &MessageTarget,
    ) -> std::result::Result<Capability, ProtocolError> {
        match target {
            MessageTarget::ImportedCap(id) => self
                .exports
                .find(*id)
                .map(|export| export.cap.clone())
                .ok_or(ProtocolError::UnknownExport(*id)),
            MessageTarget::PromisedAnswer(promised) => {
                let answer = self
                    .answers
                    .find(promised.question_id)
                    .ok_or(ProtocolError::UnknownAnswer(promised.question_id))?;
                match (&answer.results, &answer.pipeline) {
                    (Some(results), _) => results
                        .cap_at(&promised.transform)
                        .map_err(|e| ProtocolError::InvalidTransform(e.reason)),
                    (None, Some(pipeline)) => Ok(pipeline.get_pipelined_cap(&promised.transform)),
                    (None, None) => Err(ProtocolError::Invalid(
                        "Pipelined on an answer that has no results",
                    )),
                }
            }
        }
    }

    fn receive_payload(&mut self, wire: WirePayload) -> std::result::Result<Payload, ProtocolError> {
        check_cap_indices(&wire.content, wire.cap_table.len())?;
        let caps = wire
            .cap_table
            .into_iter()
            .map(|descriptor| self.receive_cap(descriptor))
            .collect();
        Ok(Payload {
            content: wire.content,
            caps,
        })
    }

    fn receive_cap(&mut self, descriptor: CapDescriptor) -> Option<Capability> {
        match descriptor {
            CapDescriptor::None => None,
            CapDescriptor::SenderHosted(id) => Some(self.import_cap(id, false)),
            CapDescriptor::SenderPromise(id) => Some(self.import_cap(id, true)),
            CapDescriptor::ReceiverHosted(id) => Some(match self.exports.find(id) {
                Some(export) => export.cap.clone(),
                None => Capability::broken(RpcError::failed(format!(
                    "Invalid receiverHosted export ID {id}"
                ))),
            }),
            CapDescriptor::ReceiverAnswer(promised) => Some(
                self.message_target_cap(&MessageTarget::PromisedAnswer(promised))
                    .unwrap_or_else(|e| Capability::broken(e.into())),
            ),
        }
    }

    fn import_cap(&mut self, id: ImportId, is_promise: bool) -> Capability {
        let conn = self.handle.clone();
        let import = self.imports.get_or_insert_with(id, || Import {
            remote_ref_count: 0,
            token: 0,
            client: Weak::new(),
            promise: Weak::new(),
        });
        import.remote_ref_count += 1;

        let client = match import.client.upgrade() {
            Some(client) => client,
            None => {
                self.next_import_token += 1;
                import.token = self.next_import_token;
                let client = Arc::new(RpcClient::import(conn.clone(), id, import.token));
                import.client = Arc::downgrade(&client);
                client
            }
        };

        if !is_promise {
            return Capability::new(client);
        }
        if let Some(promise) = import.promise.upgrade() {
            return Capability::new(promise);
        }
        let promise = Arc::new(RpcClient::promise(conn, Capability::new(client)));
        import.promise = Arc::downgrade(&promise);
        Capability::new(promise)
    }

    fn release_import(&mut self, id: ImportId, token: u64) {
        let reference_count = match self.imports.find(id) {
            Some(import) if import.token == token => import.remote_ref_count,
            // Replaced by a newer client since the release was queued.
            _ => return,
        };
        self.imports.erase(id);
        self.send(Message::Release(Release {
            id,
            reference_count,
        }));
    }

    fn write_descriptors(&mut self, caps: &[Option<Capability>]) -> (Vec<CapDescriptor>, Vec<ExportId>) {
        let mut cap_table = Vec::with_capacity(caps.len());
        let mut exports = Vec::new();
        for cap in caps {
            match cap {
                Some(cap) => {
                    let (descriptor, export) = self.write_descriptor(cap);
                    cap_table.push(descriptor);
                    exports.extend(export);
                }
                None => cap_table.push(CapDescriptor::None),
            }
        }
        (cap_table, exports)
    }

    /// Describe `cap` for the peer, exporting it if needed.
    ///
    /// Returns the export the descriptor added a reference to, if any.
    fn write_descriptor(&mut self, cap: &Capability) -> (CapDescriptor, Option<ExportId>) {
        let mut current = cap.resolved();
        loop {
            let next = match own_client(self.id, &current) {
                Some(client) => match &client.kind {
                    ClientKind::Import(import) => {
                        return (CapDescriptor::ReceiverHosted(import.id), None)
                    }
                    ClientKind::Pipeline(question, ops) => match question.slot() {
                        QuestionSlot::Sent(question_id) => {
                            return (
                                CapDescriptor::ReceiverAnswer(PromisedAnswer {
                                    question_id,
                                    transform: ops.clone(),
                                }),
                                None,
                            )
                        }
                        QuestionSlot::Redirected(pipeline) => pipeline.get_pipelined_cap(ops),
                        QuestionSlot::Failed(error) => Capability::broken(error),
                        QuestionSlot::Unsent => Capability::broken(RpcError::failed(
                            "Pipelined on a question that was never sent",
                        )),
                    },
                    ClientKind::Promise(cell) => {
                        let mut state = cell.lock();
                        state.received_call = true;
                        state.cap.clone()
                    }
                },
                None => break,
            };
            current = next.resolved();
        }

        if current.hook().is_null() {
            return (CapDescriptor::None, None);
        }

        let key = current.ptr();
        if let Some(&id) = self.exports_by_cap.get(&key) {
            if let Some(export) = self.exports.find_mut(id) {
                export.refcount += 1;
                let descriptor = if export.resolve_task.is_some() {
                    CapDescriptor::SenderPromise(id)
                } else {
                    CapDescriptor::SenderHosted(id)
                };
                return (descriptor, Some(id));
            }
        }

        self.next_export_serial += 1;
        let serial = self.next_export_serial;
        let more = current.hook().when_more_resolved();
        let id = self.exports.next(Export {
            cap: current,
            refcount: 1,
            serial,
            resolve_task: None,
        });
        self.exports_by_cap.insert(key, id);

        match more {
            Some(more) => {
                let task = self.spawn_export_resolution(id, serial, more);
                if let Some(export) = self.exports.find_mut(id) {
                    export.resolve_task = Some(task);
                }
                (CapDescriptor::SenderPromise(id), Some(id))
            }
            None => (CapDescriptor::SenderHosted(id), Some(id)),
        }
    }

    fn spawn_export_resolution(
        &self,
        export_id: ExportId,
        serial: u64,
        more: Promise<Capability>,
    ) -> AbortHandle {
        let commands = self.handle.commands.clone();
        let (abort, registration) = AbortHandle::new_pair();
        let task = async move {
            let result = more.await;
            let _ = commands.send(Command::ExportResolved {
                export_id,
                serial,
                result,
            });
        };
        tokio::spawn(Abortable::new(task, registration).in_current_span());
        abort
    }

    /// A local promise we exported has settled; tell the peer what it became.
    fn resolve_exported_promise(&mut self, export_id: ExportId, serial: u64, result: Result<Capability>) {
        let old_key = match self.exports.find(export_id) {
            Some(export) if export.serial == serial => export.cap.ptr(),
            // Released, or reused for something else.
            _ => return,
        };
        if self.exports_by_cap.get(&old_key) == Some(&export_id) {
            self.exports_by_cap.remove(&old_key);
        }

        let resolution = match result {
            Ok(cap) => {
                let resolved = cap.resolved();
                let new_key = resolved.ptr();
                let is_local = own_client(self.id, &resolved).is_none();

                if is_local && !self.exports_by_cap.contains_key(&new_key) {
                    if let Some(more) = resolved.hook().when_more_resolved() {
                        // Settled to another local promise nobody has seen: keep the entry.
                        self.next_export_serial += 1;
                        let serial = self.next_export_serial;
                        let task = self.spawn_export_resolution(export_id, serial, more);
                        if let Some(export) = self.exports.find_mut(export_id) {
                            export.cap = resolved;
                            export.serial = serial;
                            export.resolve_task = Some(task);
                        }
                        self.exports_by_cap.insert(new_key, export_id);
                        return;
                    }
                }

                let (descriptor, _) = self.write_descriptor(&resolved);
                if let Some(export) = self.exports.find_mut(export_id) {
                    export.cap = resolved;
                    export.resolve_task = None;
                }
                Resolution::Cap(descriptor)
            }
            Err(error) => {
                if let Some(export) = self.exports.find_mut(export_id) {
                    export.cap = Capability::broken(error.clone());
                    export.resolve_task = None;
                }
                Resolution::Exception(error)
            }
        };

        self.send(Message::Resolve(Resolve {
            promise_id: export_id,
            resolution,
        }));
    }

    fn release_export(&mut self, id: ExportId, count: u32) -> std::result::Result<(), ProtocolError> {
        let export = self
            .exports
            .find_mut(id)
            .ok_or(ProtocolError::UnknownExport(id))?;
        if export.refcount < count {
            return Err(ProtocolError::Invalid(
                "Release would drop an export's reference count below zero",
            ));
        }
        export.refcount -= count;
        if export.refcount == 0 {
            if let Some(export) = self.exports.erase(id) {
                let key = export.cap.ptr();
                if self.exports_by_cap.get(&key) == Some(&id) {
                    self.exports_by_cap.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn release_exports(&mut self, ids: &[ExportId]) -> std::result::Result<(), ProtocolError> {
        ids.iter().try_for_each(|id| self.release_export(*id, 1))
    }

    // ---- Promise resolution and embargoes ----

    fn resolve_question_pipeline(&mut self, question: &Arc<QuestionRef>, result: Result<Pipeline>) {
        for (ops, client) in question.resolve_pipeline(result.clone()) {
            let replacement = match &result {
                Ok(pipeline) => pipeline.get_pipelined_cap(&ops),
                Err(error) => Capability::broken(error.clone()),
            };
            self.resolve_promise(&client, replacement);
        }
    }

    /// Point a peer-backed promise at what it resolved to.
    ///
    /// If calls already went out through the promise and the new target is not
    /// on this connection, new calls are held behind an embargo until a
    /// `Disembargo` round trip shows the earlier ones have arrived.
    fn resolve_promise(&mut self, client: &RpcClient, replacement: Capability) {
        let Some(cell) = client.promise_cell() else {
            return;
        };
        let (received_call, previous) = {
            let state = cell.lock();
            if state.resolved {
                return;
            }
            (state.received_call, state.cap.clone())
        };

        let replacement = replacement.resolved();
        let reflected = own_client(self.id, &replacement).is_none()
            && replacement.hook().error().is_none()
            && !replacement.hook().is_null();

        if received_call && reflected && self.status == ConnectionStatus::Active {
            let previous_route = own_client(self.id, &previous)
                .map(|client| client.kind.clone())
                .map(|kind| self.route(kind));
            if let Some(CallRoute::Wire(target)) = previous_route {
                let queued = Arc::new(QueuedClient::new());
                let embargo_id = self.embargoes.next(Embargo {
                    queued: queued.clone(),
                    target: replacement,
                });
                debug!(embargo_id, "Embargoing calls on resolved promise");
                self.send(Message::Disembargo(Disembargo {
                    target,
                    context: DisembargoContext::SenderLoopback(embargo_id),
                }));
                cell.resolve(Capability::new(queued));
                return;
            }
        }

        cell.resolve(replacement);
    }

    // ---- Shutdown ----

    fn disconnect(&mut self, reason: RpcError, send_abort: bool) {
        if self.status != ConnectionStatus::Active {
            return;
        }
        self.status = ConnectionStatus::Disconnecting;
        self.status_tx.send_replace(ConnectionStatus::Disconnecting);
        info!("Disconnecting: {}", reason);

        if send_abort {
            self.send(Message::Abort(reason.clone()));
        }
        let error = RpcError::disconnected(reason.reason);

        for (_, mut question) in self.questions.drain() {
            if let Some(response) = question.response.take() {
                let _ = response.send(ready(Err(error.clone())));
            }
            if let Some(question_ref) = question.question_ref.upgrade() {
                question_ref.fail(error.clone());
                self.resolve_question_pipeline(&question_ref, Err(error.clone()));
            }
        }

        for (_, import) in self.imports.drain() {
            if let Some(promise) = import.promise.upgrade() {
                if let Some(cell) = promise.promise_cell() {
                    if !cell.is_resolved() {
                        cell.resolve(Capability::broken(error.clone()));
                    }
                }
            }
        }

        for (_, embargo) in self.embargoes.drain() {
            embargo.queued.resolve(Err(error.clone()));
        }

        // Dropping answers aborts their calls; dropping exports lets go of our objects.
        drop(self.answers.drain());
        drop(self.exports.drain());
        self.exports_by_cap.clear();
    }
}
