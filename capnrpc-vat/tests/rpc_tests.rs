// Two-party RPC tests
// Two vats joined by an in-process byte stream, exercising calls, pipelining,
// capability passing, tail calls, embargoes and disconnection end to end.

mod common;

use capnrpc_core::{
    Capability, CapabilityServerSet, ErrorKind, Payload, QueuedClient, RemotePromise, RpcError,
    Value,
};
use common::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod two_party_rpc_tests {
    use super::*;

    fn more_stuff() -> (Capability, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let handles = Arc::new(AtomicUsize::new(0));
        let cap = Capability::from_server(TestMoreStuff::new(calls.clone(), handles.clone()));
        (cap, calls, handles)
    }

    #[tokio::test]
    async fn test_basic_calls() {
        println!("🧪 Testing basic calls over a two-party connection");

        let count = Arc::new(AtomicUsize::new(0));
        let vats = connect(Capability::from_server(TestInterface::new(count.clone()))).await;
        let client = vats.client.bootstrap().await;

        let response = call_foo(&client).await.unwrap();
        assert_eq!(text_field(&response, 0).as_deref(), Some("foo"));
        println!("✅ foo returned its result");

        let err = client
            .call(TEST_INTERFACE, 1, Payload::default())
            .response
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unimplemented);
        println!("✅ Unregistered method reported as unimplemented");

        client
            .call(TEST_INTERFACE, 2, Payload::default())
            .response
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        println!("✅ Server saw exactly the implemented calls");
    }

    #[tokio::test]
    async fn test_application_errors_cross_the_wire() {
        let count = Arc::new(AtomicUsize::new(0));
        let vats = connect(Capability::from_server(TestInterface::new(count))).await;
        let client = vats.client.bootstrap().await;

        let err = client
            .call(
                TEST_INTERFACE,
                0,
                params([Value::Int(5), Value::Bool(false)]),
            )
            .response
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Failed);
        assert!(err.reason.contains("i = 123"));

        // The connection survives an application error.
        assert!(call_foo(&client).await.is_ok());
    }

    #[tokio::test]
    async fn test_pipelining() {
        println!("🧪 Testing promise pipelining");

        let server_calls = Arc::new(AtomicUsize::new(0));
        let chained_calls = Arc::new(AtomicUsize::new(0));
        let vats = connect(Capability::from_server(TestPipeline {
            call_count: server_calls.clone(),
        }))
        .await;
        let client = vats.client.bootstrap().await;

        let mut request = Payload::default();
        let in_cap = request.add_cap(Capability::from_server(TestInterface::new(
            chained_calls.clone(),
        )));
        request.content = Value::structure([Value::Int(234), in_cap]);

        let RemotePromise { response, pipeline } = client.call(TEST_PIPELINE, 0, request);
        let out_cap = pipeline.get_cap(&[1, 0]);
        let pipelined = out_cap.call(
            TEST_INTERFACE,
            0,
            params([Value::Int(321), Value::Bool(false)]),
        );
        let grault = out_cap.call(TEST_EXTENDS, 1, Payload::default());
        println!("✅ Calls issued on the promised capability before getCap returned");

        let pipelined = pipelined.response.await.unwrap();
        assert_eq!(text_field(&pipelined, 0).as_deref(), Some("bar"));
        let grault = grault.response.await.unwrap();
        assert_eq!(grault.content().field(0).as_int(), Some(123));

        let response = response.await.unwrap();
        assert_eq!(text_field(&response, 0).as_deref(), Some("bar"));

        assert_eq!(chained_calls.load(Ordering::SeqCst), 1);
        assert_eq!(server_calls.load(Ordering::SeqCst), 3);
        println!("✅ Pipelined calls reached the right object");
    }

    #[tokio::test]
    async fn test_release() {
        println!("🧪 Testing capability release");

        let (cap, _calls, handles) = more_stuff();
        let vats = connect(cap).await;
        let client = vats.client.bootstrap().await;

        let get_handle = |client: &Capability| {
            client.call(TEST_MORE_STUFF, more_stuff::GET_HANDLE, Payload::default())
        };
        let response = get_handle(&client).response.await.unwrap();
        let handle1 = response.get_cap(0).unwrap();
        drop(response);
        let response = get_handle(&client).response.await.unwrap();
        let handle2 = response.get_cap(0).unwrap();
        drop(response);

        assert!(eventually(|| handles.load(Ordering::SeqCst) == 2).await);

        drop(handle1);
        assert!(eventually(|| handles.load(Ordering::SeqCst) == 1).await);
        println!("✅ First handle released on the server");

        drop(handle2);
        assert!(eventually(|| handles.load(Ordering::SeqCst) == 0).await);
        println!("✅ All handles released");
    }

    #[tokio::test]
    async fn test_promise_resolve() {
        println!("🧪 Testing resolution of a promise passed to the peer");

        let (cap, _calls, _handles) = more_stuff();
        let vats = connect(cap).await;
        let client = vats.client.bootstrap().await;

        let queued = Arc::new(QueuedClient::new());
        let promise = Capability::new(queued.clone());

        let direct = client.call(
            TEST_MORE_STUFF,
            more_stuff::CALL_FOO,
            cap_params(promise.clone()),
        );
        let when_resolved = client.call(
            TEST_MORE_STUFF,
            more_stuff::CALL_FOO_WHEN_RESOLVED,
            cap_params(promise),
        );

        // Let both calls reach the server before the promise settles.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let count = Arc::new(AtomicUsize::new(0));
        queued.resolve(Ok(Capability::from_server(TestInterface::new(count.clone()))));

        let direct = direct.response.await.unwrap();
        let when_resolved = when_resolved.response.await.unwrap();
        assert_eq!(text_field(&direct, 0).as_deref(), Some("bar"));
        assert_eq!(text_field(&when_resolved, 0).as_deref(), Some("bar"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        println!("✅ Both calls reached the resolved capability");
    }

    #[tokio::test]
    async fn test_call_broken_promise() {
        let (cap, _calls, _handles) = more_stuff();
        let vats = connect(cap).await;
        let client = vats.client.bootstrap().await;

        let queued = Arc::new(QueuedClient::new());
        client
            .call(
                TEST_MORE_STUFF,
                more_stuff::HOLD,
                cap_params(Capability::new(queued.clone())),
            )
            .response
            .await
            .unwrap();

        queued.resolve(Err(RpcError::failed("promise was broken")));

        let err = client
            .call(TEST_MORE_STUFF, more_stuff::CALL_HELD, Payload::default())
            .response
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Failed);
        assert!(err.reason.contains("promise was broken"));
    }

    #[tokio::test]
    async fn test_tail_call() {
        println!("🧪 Testing tail calls back to the caller's vat");

        let caller_count = Arc::new(AtomicUsize::new(0));
        let callee_count = Arc::new(AtomicUsize::new(0));
        let vats = connect(Capability::from_server(TestTailCaller {
            call_count: caller_count.clone(),
        }))
        .await;
        let caller = vats.client.bootstrap().await;

        let mut request = Payload::default();
        let callee = request.add_cap(Capability::from_server(TestTailCallee {
            call_count: callee_count.clone(),
        }));
        request.content = Value::structure([Value::Int(456), callee]);

        let RemotePromise { response, pipeline } = caller.call(TEST_TAIL_CALLER, 0, request);
        let c = pipeline.get_cap(&[2]);
        let dependent0 = get_call_sequence(&c, 0);

        let response = response.await.unwrap();
        assert_eq!(response.content().field(0).as_int(), Some(456));
        assert_eq!(text_field(&response, 1).as_deref(), Some("from TestTailCaller"));
        println!("✅ Results came back from the callee");

        let dependent1 = get_call_sequence(&c, 1);
        let dependent2 = get_call_sequence(&c, 2);

        assert_eq!(call_sequence(dependent0).await, 0);
        assert_eq!(call_sequence(dependent1).await, 1);
        assert_eq!(call_sequence(dependent2).await, 2);
        println!("✅ Calls on the tail call's results stayed in order");

        assert_eq!(caller_count.load(Ordering::SeqCst), 1);
        assert_eq!(callee_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embargo() {
        println!("🧪 Testing embargo on a promise that resolves to a local object");

        let (cap, _calls, _handles) = more_stuff();
        let vats = connect(cap).await;
        let client = vats.client.bootstrap().await;

        let early = client.call(
            TEST_MORE_STUFF,
            more_stuff::GET_CALL_SEQUENCE,
            Payload::default(),
        );
        let RemotePromise { response, pipeline } = client.call(
            TEST_MORE_STUFF,
            more_stuff::ECHO,
            cap_params(Capability::from_server(TestCallOrder::default())),
        );
        let echoed = pipeline.get_cap(&[0]);

        let call0 = get_call_sequence(&echoed, 0);
        let call1 = get_call_sequence(&echoed, 1);
        early.response.await.unwrap();
        let call2 = get_call_sequence(&echoed, 2);

        response.await.unwrap();
        println!("✅ Echo returned our own object");

        let call3 = get_call_sequence(&echoed, 3);
        let call4 = get_call_sequence(&echoed, 4);
        let call5 = get_call_sequence(&echoed, 5);

        for (expected, call) in [call0, call1, call2, call3, call4, call5]
            .into_iter()
            .enumerate()
        {
            assert_eq!(call_sequence(call).await, expected as i64);
        }
        println!("✅ Calls arrived in the order they were made");
    }

    #[tokio::test]
    async fn test_embargo_lifted_leaves_no_state() {
        let (cap, _calls, _handles) = more_stuff();
        let vats = connect(cap).await;
        let client = vats.client.bootstrap().await;

        let RemotePromise { response, pipeline } = client.call(
            TEST_MORE_STUFF,
            more_stuff::ECHO,
            cap_params(Capability::from_server(TestCallOrder::default())),
        );
        let echoed = pipeline.get_cap(&[0]);
        let first = get_call_sequence(&echoed, 0);
        response.await.unwrap();
        let second = get_call_sequence(&echoed, 1);

        assert_eq!(call_sequence(first).await, 0);
        assert_eq!(call_sequence(second).await, 1);

        let connection = vats.client.connection().unwrap();
        let stats = connection.stats().await.unwrap();
        assert_eq!(stats.embargoes, 0);
    }

    #[tokio::test]
    async fn test_unwrap_returned_capability() {
        println!("🧪 Testing that an echoed capability unwraps to the local server");

        let (cap, _calls, _handles) = more_stuff();
        let vats = connect(cap).await;
        let client = vats.client.bootstrap().await;

        let set = CapabilityServerSet::new();
        let local = set.add(TestCallOrder::default());

        let RemotePromise { response, pipeline } =
            client.call(TEST_MORE_STUFF, more_stuff::ECHO, cap_params(local.clone()));
        let promised = pipeline.get_cap(&[0]);

        let unwrapped = set.get_local_server(&promised).await;
        assert!(unwrapped.is_some());
        println!("✅ Pipelined promise unwrapped once it resolved");

        let response = response.await.unwrap();
        let returned = response.get_cap(0).unwrap();
        assert!(set.get_local_server(&returned).await.is_some());
        assert!(set.get_local_server(&client).await.is_none());
        println!("✅ Remote capabilities are not mistaken for local ones");
    }

    #[tokio::test]
    async fn test_call_cancel_releases_params() {
        println!("🧪 Testing cancellation of an outstanding call");

        let (cap, _calls, _handles) = more_stuff();
        let vats = connect(cap).await;
        let client = vats.client.bootstrap().await;

        let dropped = Arc::new(AtomicBool::new(false));
        let flag = Capability::from_server(DropFlag {
            dropped: dropped.clone(),
        });
        let pending = client.call(TEST_MORE_STUFF, more_stuff::EXPECT_CANCEL, cap_params(flag));

        // A call issued after it completes only once the server has seen both.
        client
            .call(TEST_MORE_STUFF, more_stuff::GET_CALL_SEQUENCE, Payload::default())
            .response
            .await
            .unwrap();
        assert!(!dropped.load(Ordering::SeqCst));

        drop(pending);
        assert!(eventually(|| dropped.load(Ordering::SeqCst)).await);
        println!("✅ Canceled call let go of its parameters");
    }

    #[tokio::test]
    async fn test_disconnect_fails_outstanding_calls() {
        println!("🧪 Testing disconnection with calls in flight");

        let (cap, _calls, _handles) = more_stuff();
        let vats = connect(cap).await;
        let client = vats.client.bootstrap().await;

        let pending: Vec<_> = (0..5)
            .map(|_| {
                client
                    .call(TEST_MORE_STUFF, more_stuff::EXPECT_CANCEL, Payload::default())
                    .response
            })
            .collect();
        client
            .call(TEST_MORE_STUFF, more_stuff::GET_CALL_SEQUENCE, Payload::default())
            .response
            .await
            .unwrap();

        vats.server_connection
            .disconnect(RpcError::failed("shutting down"));

        for response in pending {
            let err = response.await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::Disconnected);
        }
        println!("✅ Every outstanding call failed with Disconnected");

        vats.server_connection.on_disconnect().await;
        let connection_gone = eventually(|| vats.client.connection().is_none()).await;
        assert!(connection_gone);

        let err = client
            .call(TEST_MORE_STUFF, more_stuff::GET_CALL_SEQUENCE, Payload::default())
            .response
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Disconnected);
        println!("✅ New calls fail once the connection is gone");
    }

    #[tokio::test]
    async fn test_bootstrap_both_ways() {
        let count = Arc::new(AtomicUsize::new(0));
        let (cap, _calls, _handles) = more_stuff();
        let vats = connect_with(
            cap,
            Some(Capability::from_server(TestInterface::new(count.clone()))),
            capnrpc_vat::RpcConfig::default(),
        )
        .await;

        // The client side connection only exists once the client bootstraps.
        let _server_cap = vats.client.bootstrap().await;

        let client_cap = vats.server_connection.bootstrap();
        let response = call_foo(&client_cap).await.unwrap();
        assert_eq!(text_field(&response, 0).as_deref(), Some("foo"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_without_interface() {
        let (cap, _calls, _handles) = more_stuff();
        let vats = connect(cap).await;
        let _server_cap = vats.client.bootstrap().await;

        let missing = vats.server_connection.bootstrap();
        let err = missing.when_resolved().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Failed);
        assert!(err.reason.contains("bootstrap"));
    }

    #[tokio::test]
    async fn test_malformed_envelope_aborts_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        println!("🧪 Testing that an undecodable envelope is answered with Abort");
        let (cap, _calls, _handles) = more_stuff();
        let (mut raw, server_stream) = tokio::io::duplex(64 * 1024);
        let connection = capnrpc_vat::TwoPartyServer::new(cap)
            .serve(server_stream)
            .await
            .unwrap();

        let body = br#"{"call":{"questionId":"one"}}"#;
        raw.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        raw.write_all(body).await.unwrap();

        let mut len = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(2), raw.read_exact(&mut len))
            .await
            .expect("server should answer before timing out")
            .unwrap();
        let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
        raw.read_exact(&mut frame).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        match capnrpc_core::Message::from_json(&json).unwrap() {
            capnrpc_core::Message::Abort(error) => {
                assert_eq!(error.kind, ErrorKind::Unsupported);
            }
            other => panic!("Expected Abort, got {:?}", other),
        }
        println!("✅ Peer received Abort");

        connection.on_disconnect().await;
        assert_eq!(connection.status(), capnrpc_vat::ConnectionStatus::Closed);
        println!("✅ Connection closed after the Abort");
    }

    #[tokio::test]
    async fn test_streaming_calls_across_the_wire() {
        use crate::common::streaming::*;

        println!("🧪 Testing streaming calls delivered over a connection");
        let server = Arc::new(TestStreaming::default());
        let vats = connect(Capability::from_arc(server.clone())).await;
        let client = vats.client.bootstrap().await;

        let first = client.call(TEST_STREAMING, DO_STREAM_I, Payload::new(Value::Int(123)));
        let second = client.call(TEST_STREAMING, DO_STREAM_J, Payload::new(Value::Int(321)));
        let finish = client.call(TEST_STREAMING, FINISH_STREAM, Payload::default());

        assert!(eventually(|| server.sums().0 == 123).await);
        // Give the held calls time to arrive; they must not run yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.sums(), (123, 0));

        assert!(server.settle_one());
        first.response.await.unwrap();
        assert!(eventually(|| server.sums().1 == 321).await);
        println!("✅ Second streaming call ran after the first settled");

        assert!(eventually(|| server.settle_one()).await);
        second.response.await.unwrap();
        let totals = finish.response.await.unwrap();
        assert_eq!(totals.content().field(0).as_int(), Some(123));
        assert_eq!(totals.content().field(1).as_int(), Some(321));
        println!("✅ Non-streaming call answered once both streams finished");
    }
}
