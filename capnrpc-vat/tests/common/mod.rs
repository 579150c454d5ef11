// Shared fixtures for the connection tests: a handful of test servers and
// helpers to join two vats over an in-process stream.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use capnrpc_core::{
    results, tail_call, Capability, MethodTable, Payload, Promise, Reply, Response, RpcError,
    Server, Value,
};
use capnrpc_vat::{ConnectionHandle, RpcConfig, TwoPartyClient, TwoPartyServer};
use futures::FutureExt;

pub const TEST_INTERFACE: u64 = 0x88eb_12a0_e0af_84b2;
pub const TEST_EXTENDS: u64 = 0xe4e9_bac9_8691_4ad4;
pub const TEST_PIPELINE: u64 = 0xa5a4_04ca_52b4_1aa9;
pub const TEST_CALL_ORDER: u64 = 0xa0e7_7035_bdff_0051;
pub const TEST_TAIL_CALLEE: u64 = 0xddd6_99e1_5a30_b398;
pub const TEST_TAIL_CALLER: u64 = 0x870b_ad71_d4bf_3f64;
pub const TEST_HANDLE: u64 = 0xa7ec_b7ac_a0f9_6e0c;
pub const TEST_MORE_STUFF: u64 = 0xddc7_0bf9_7841_33cf;
pub const TEST_STREAMING: u64 = 0xf838_dca6_c872_1bdb;

pub mod more_stuff {
    pub const CALL_FOO: u16 = 0;
    pub const CALL_FOO_WHEN_RESOLVED: u16 = 1;
    pub const EXPECT_CANCEL: u16 = 2;
    pub const HOLD: u16 = 3;
    pub const CALL_HELD: u16 = 4;
    pub const GET_HELD: u16 = 5;
    pub const ECHO: u16 = 6;
    pub const GET_CALL_SEQUENCE: u16 = 7;
    pub const GET_HANDLE: u16 = 8;
}

/// Payload whose content is a struct of `fields`.
pub fn params(fields: impl IntoIterator<Item = Value>) -> Payload {
    Payload::new(Value::structure(fields))
}

/// Payload carrying one capability in field 0.
pub fn cap_params(cap: Capability) -> Payload {
    let mut payload = Payload::default();
    let field = payload.add_cap(cap);
    payload.content = Value::structure([field]);
    payload
}

pub fn text_reply(text: &str) -> Promise<Reply> {
    results(params([Value::text(text)]))
}

fn fail(reason: &str) -> Promise<Reply> {
    futures::future::ready(Err(RpcError::failed(reason))).boxed()
}

pub fn text_field(response: &Response, index: usize) -> Option<String> {
    response
        .content()
        .field(index)
        .as_text()
        .map(str::to_string)
}

/// `foo(i = 123, j = true)` on a `TestInterface`.
pub async fn call_foo(cap: &Capability) -> Result<Response, RpcError> {
    cap.call(
        TEST_INTERFACE,
        0,
        params([Value::Int(123), Value::Bool(true)]),
    )
    .response
    .await
}

// ---- TestInterface ----

pub struct TestInterface {
    pub call_count: Arc<AtomicUsize>,
}

static TEST_INTERFACE_METHODS: LazyLock<MethodTable<TestInterface>> = LazyLock::new(|| {
    MethodTable::<TestInterface>::new("TestInterface")
        .method(TEST_INTERFACE, 0, TestInterface::foo)
        .method(TEST_INTERFACE, 2, TestInterface::baz)
});

impl TestInterface {
    pub fn new(call_count: Arc<AtomicUsize>) -> Self {
        Self { call_count }
    }

    fn foo(&self, params: Payload) -> Promise<Reply> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let i = params.content.field(0).as_int();
        let j = params.content.field(1).as_bool();
        if i != Some(123) || j != Some(true) {
            return fail("foo expects i = 123 and j = true");
        }
        text_reply("foo")
    }

    fn baz(&self, _params: Payload) -> Promise<Reply> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        results(Payload::default())
    }
}

impl Server for TestInterface {
    fn dispatch(&self, interface_id: u64, method_id: u16, params: Payload) -> Promise<Reply> {
        TEST_INTERFACE_METHODS.dispatch(self, interface_id, method_id, params)
    }
}

// ---- TestExtends ----

/// Answers `TestInterface.foo` plus its own `grault`.
pub struct TestExtends {
    pub call_count: Arc<AtomicUsize>,
}

static TEST_EXTENDS_METHODS: LazyLock<MethodTable<TestExtends>> = LazyLock::new(|| {
    MethodTable::<TestExtends>::new("TestExtends")
        .method(TEST_INTERFACE, 0, |server, params| {
            server.call_count.fetch_add(1, Ordering::SeqCst);
            let i = params.content.field(0).as_int();
            let j = params.content.field(1).as_bool();
            if i != Some(321) || j != Some(false) {
                return fail("TestExtends.foo expects i = 321 and j = false");
            }
            text_reply("bar")
        })
        .method(TEST_EXTENDS, 1, |server, _params| {
            server.call_count.fetch_add(1, Ordering::SeqCst);
            results(params([Value::Int(123), Value::text("grault")]))
        })
});

impl Server for TestExtends {
    fn dispatch(&self, interface_id: u64, method_id: u16, params: Payload) -> Promise<Reply> {
        TEST_EXTENDS_METHODS.dispatch(self, interface_id, method_id, params)
    }
}

// ---- TestPipeline ----

/// `getCap(n = 234, inCap)` calls `inCap.foo` and returns
/// `(s = "bar", outBox = (cap = TestExtends))`.
pub struct TestPipeline {
    pub call_count: Arc<AtomicUsize>,
}

static TEST_PIPELINE_METHODS: LazyLock<MethodTable<TestPipeline>> = LazyLock::new(|| {
    MethodTable::<TestPipeline>::new("TestPipeline")
        .method(TEST_PIPELINE, 0, TestPipeline::get_cap)
});

impl TestPipeline {
    fn get_cap(&self, params: Payload) -> Promise<Reply> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let call_count = self.call_count.clone();
        async move {
            if params.content.field(0).as_int() != Some(234) {
                return Err(RpcError::failed("getCap expects n = 234"));
            }
            let in_cap = params.cap_at(&capnrpc_core::PipelineOp::path(&[1]))?;
            let response = call_foo(&in_cap).await?;
            if text_field(&response, 0).as_deref() != Some("foo") {
                return Err(RpcError::failed("inCap.foo returned the wrong value"));
            }

            let mut payload = Payload::default();
            let cap = payload.add_cap(Capability::from_server(TestExtends { call_count }));
            payload.content = Value::structure([Value::text("bar"), Value::structure([cap])]);
            Ok(Reply::Results(payload))
        }
        .boxed()
    }
}

impl Server for TestPipeline {
    fn dispatch(&self, interface_id: u64, method_id: u16, params: Payload) -> Promise<Reply> {
        TEST_PIPELINE_METHODS.dispatch(self, interface_id, method_id, params)
    }
}

// ---- TestCallOrder ----

/// `getCallSequence(expected)` returns how many calls came before it.
#[derive(Default)]
pub struct TestCallOrder {
    count: AtomicUsize,
}

static TEST_CALL_ORDER_METHODS: LazyLock<MethodTable<TestCallOrder>> = LazyLock::new(|| {
    MethodTable::<TestCallOrder>::new("TestCallOrder")
        .method(TEST_CALL_ORDER, 0, |server, _params| {
            let n = server.count.fetch_add(1, Ordering::SeqCst);
            results(params([Value::Int(n as i64)]))
        })
});

impl Server for TestCallOrder {
    fn dispatch(&self, interface_id: u64, method_id: u16, params: Payload) -> Promise<Reply> {
        TEST_CALL_ORDER_METHODS.dispatch(self, interface_id, method_id, params)
    }
}

pub fn get_call_sequence(cap: &Capability, expected: i64) -> capnrpc_core::RemotePromise {
    cap.call(TEST_CALL_ORDER, 0, params([Value::Int(expected)]))
}

pub async fn call_sequence(promise: capnrpc_core::RemotePromise) -> i64 {
    let response = promise.response.await.unwrap();
    response.content().field(0).as_int().unwrap()
}

// ---- TestTailCallee / TestTailCaller ----

/// `foo(i, t)` returns `(i, t, c = TestCallOrder)`.
pub struct TestTailCallee {
    pub call_count: Arc<AtomicUsize>,
}

static TEST_TAIL_CALLEE_METHODS: LazyLock<MethodTable<TestTailCallee>> = LazyLock::new(|| {
    MethodTable::<TestTailCallee>::new("TestTailCallee")
        .method(TEST_TAIL_CALLEE, 0, |server, params| {
            server.call_count.fetch_add(1, Ordering::SeqCst);
            let mut payload = Payload::default();
            let c = payload.add_cap(Capability::from_server(TestCallOrder::default()));
            payload.content = Value::structure([
                params.content.field(0).clone(),
                params.content.field(1).clone(),
                c,
            ]);
            results(payload)
        })
});

impl Server for TestTailCallee {
    fn dispatch(&self, interface_id: u64, method_id: u16, params: Payload) -> Promise<Reply> {
        TEST_TAIL_CALLEE_METHODS.dispatch(self, interface_id, method_id, params)
    }
}

/// `foo(i, callee)` tail-calls `callee.foo(i, "from TestTailCaller")`.
pub struct TestTailCaller {
    pub call_count: Arc<AtomicUsize>,
}

static TEST_TAIL_CALLER_METHODS: LazyLock<MethodTable<TestTailCaller>> = LazyLock::new(|| {
    MethodTable::<TestTailCaller>::new("TestTailCaller")
        .method(TEST_TAIL_CALLER, 0, |server, params| {
            server.call_count.fetch_add(1, Ordering::SeqCst);
            let callee = match params.cap_at(&capnrpc_core::PipelineOp::path(&[1])) {
                Ok(callee) => callee,
                Err(e) => return futures::future::ready(Err(e)).boxed(),
            };
            let request = callee.new_call(TEST_TAIL_CALLEE, 0).with_content(Value::structure([
                params.content.field(0).clone(),
                Value::text("from TestTailCaller"),
            ]));
            tail_call(request)
        })
});

impl Server for TestTailCaller {
    fn dispatch(&self, interface_id: u64, method_id: u16, params: Payload) -> Promise<Reply> {
        TEST_TAIL_CALLER_METHODS.dispatch(self, interface_id, method_id, params)
    }
}

// ---- Handles ----

/// Counts live instances through a shared counter.
pub struct Handle {
    live: Arc<AtomicUsize>,
}

impl Handle {
    pub fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self { live }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Server for Handle {
    fn dispatch(&self, interface_id: u64, method_id: u16, _params: Payload) -> Promise<Reply> {
        futures::future::ready(Err(capnrpc_core::unimplemented_method(
            interface_id,
            method_id,
        )))
        .boxed()
    }
}

/// Flips a flag when dropped.
pub struct DropFlag {
    pub dropped: Arc<AtomicBool>,
}

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

impl Server for DropFlag {
    fn dispatch(&self, interface_id: u64, method_id: u16, _params: Payload) -> Promise<Reply> {
        futures::future::ready(Err(capnrpc_core::unimplemented_method(
            interface_id,
            method_id,
        )))
        .boxed()
    }
}

// ---- TestMoreStuff ----

pub struct TestMoreStuff {
    pub call_count: Arc<AtomicUsize>,
    pub handle_count: Arc<AtomicUsize>,
    held: Mutex<Option<Capability>>,
}

impl TestMoreStuff {
    pub fn new(call_count: Arc<AtomicUsize>, handle_count: Arc<AtomicUsize>) -> Self {
        Self {
            call_count,
            handle_count,
            held: Mutex::new(None),
        }
    }

    fn held(&self) -> Option<Capability> {
        self.held.lock().unwrap().clone()
    }
}

fn call_foo_reply(cap: Capability) -> Promise<Reply> {
    async move {
        let response = call_foo(&cap).await?;
        if text_field(&response, 0).as_deref() != Some("foo") {
            return Err(RpcError::failed("foo returned the wrong value"));
        }
        Ok(Reply::Results(params([Value::text("bar")])))
    }
    .boxed()
}

static TEST_MORE_STUFF_METHODS: LazyLock<MethodTable<TestMoreStuff>> = LazyLock::new(|| {
    use more_stuff::*;

    MethodTable::<TestMoreStuff>::new("TestMoreStuff")
        .method(TEST_MORE_STUFF, CALL_FOO, |_server, params| {
            match params.get_cap(0) {
                Ok(cap) => call_foo_reply(cap),
                Err(e) => futures::future::ready(Err(e)).boxed(),
            }
        })
        .method(TEST_MORE_STUFF, CALL_FOO_WHEN_RESOLVED, |_server, params| {
            let cap = match params.get_cap(0) {
                Ok(cap) => cap,
                Err(e) => return futures::future::ready(Err(e)).boxed(),
            };
            async move {
                cap.when_resolved().await?;
                call_foo_reply(cap).await
            }
            .boxed()
        })
        .method(TEST_MORE_STUFF, EXPECT_CANCEL, |_server, params| {
            // Keeps the parameters alive until the call is canceled.
            async move {
                let _params = params;
                futures::future::pending::<()>().await;
                Ok(Reply::Results(Payload::default()))
            }
            .boxed()
        })
        .method(TEST_MORE_STUFF, HOLD, |server, params| {
            *server.held.lock().unwrap() = params.get_cap(0).ok();
            results(Payload::default())
        })
        .method(TEST_MORE_STUFF, CALL_HELD, |server, _params| match server.held() {
            Some(cap) => call_foo_reply(cap),
            None => fail("nothing held"),
        })
        .method(TEST_MORE_STUFF, GET_HELD, |server, _params| match server.held() {
            Some(cap) => results(cap_params(cap)),
            None => fail("nothing held"),
        })
        .method(TEST_MORE_STUFF, ECHO, |_server, params| {
            match params.get_cap(0) {
                Ok(cap) => results(cap_params(cap)),
                Err(e) => futures::future::ready(Err(e)).boxed(),
            }
        })
        .method(TEST_MORE_STUFF, GET_CALL_SEQUENCE, |server, _params| {
            let n = server.call_count.fetch_add(1, Ordering::SeqCst);
            results(params([Value::Int(n as i64)]))
        })
        .method(TEST_MORE_STUFF, GET_HANDLE, |server, _params| {
            let handle = Capability::from_server(Handle::new(server.handle_count.clone()));
            results(cap_params(handle))
        })
});

impl Server for TestMoreStuff {
    fn dispatch(&self, interface_id: u64, method_id: u16, params: Payload) -> Promise<Reply> {
        TEST_MORE_STUFF_METHODS.dispatch(self, interface_id, method_id, params)
    }
}

// ---- Two vats over a duplex stream ----

pub struct TestVats {
    pub client: TwoPartyClient,
    pub server_connection: ConnectionHandle,
}

/// Join a client and a server vat that offers `bootstrap`.
pub async fn connect(bootstrap: Capability) -> TestVats {
    connect_with(bootstrap, None, RpcConfig::default()).await
}

pub async fn connect_with(
    bootstrap: Capability,
    client_bootstrap: Option<Capability>,
    config: RpcConfig,
) -> TestVats {
    capnrpc_vat::init_test_logging();
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let server = TwoPartyServer::with_config(bootstrap, config.clone());
    let server_connection = server.serve(server_stream).await.unwrap();
    let client = TwoPartyClient::with_bootstrap(client_stream, client_bootstrap, config);
    TestVats {
        client,
        server_connection,
    }
}

/// Poll `condition` until it holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ---- TestStreaming ----

pub mod streaming {
    pub const DO_STREAM_I: u16 = 0;
    pub const DO_STREAM_J: u16 = 1;
    pub const FINISH_STREAM: u16 = 2;
}

/// Sums streamed values. Each streaming call stays open until `settle_one`.
#[derive(Default)]
pub struct TestStreaming {
    pub i_sum: Mutex<i64>,
    pub j_sum: Mutex<i64>,
    fulfiller: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

static TEST_STREAMING_METHODS: LazyLock<MethodTable<TestStreaming>> = LazyLock::new(|| {
    use streaming::*;

    MethodTable::<TestStreaming>::new("TestStreaming")
        .streaming(TEST_STREAMING, DO_STREAM_I, |server, params| {
            *server.i_sum.lock().unwrap() += params.content.as_int().unwrap_or(0);
            server.pending()
        })
        .streaming(TEST_STREAMING, DO_STREAM_J, |server, params| {
            *server.j_sum.lock().unwrap() += params.content.as_int().unwrap_or(0);
            server.pending()
        })
        .method(TEST_STREAMING, FINISH_STREAM, |server, _params| {
            let (i, j) = server.sums();
            results(params([Value::Int(i), Value::Int(j)]))
        })
});

impl TestStreaming {
    pub fn sums(&self) -> (i64, i64) {
        (*self.i_sum.lock().unwrap(), *self.j_sum.lock().unwrap())
    }

    /// Complete the streaming call in flight. False if there is none yet.
    pub fn settle_one(&self) -> bool {
        match self.fulfiller.lock().unwrap().take() {
            Some(fulfiller) => fulfiller.send(()).is_ok(),
            None => false,
        }
    }

    fn pending(&self) -> Promise<Reply> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        *self.fulfiller.lock().unwrap() = Some(tx);
        async move {
            rx.await.map_err(|_| RpcError::failed("streaming call abandoned"))?;
            Ok(Reply::Results(Payload::default()))
        }
        .boxed()
    }
}

impl Server for TestStreaming {
    fn dispatch(&self, interface_id: u64, method_id: u16, params: Payload) -> Promise<Reply> {
        TEST_STREAMING_METHODS.dispatch(self, interface_id, method_id, params)
    }

    fn is_streaming(&self, interface_id: u64, method_id: u16) -> bool {
        TEST_STREAMING_METHODS.is_streaming(interface_id, method_id)
    }
}
