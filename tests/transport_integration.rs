//! Integration tests for the QUIC request transport
//!
//! Tests real QUIC connections between store nodes using ephemeral ports.

use ring_store::infrastructure::ManualClock;
use ring_store::replication::{
    decode_message, encode_message, Coordinator, Item, MembershipRequest, ReplicationConfig, Request, Response,
    StoreError, StoreRequest, Transport, WriteOp,
};
use std::sync::Arc;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize rustls CryptoProvider for tests
fn init_crypto() {
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn node(name: &str) -> Arc<Coordinator> {
    init_crypto();
    let config = ReplicationConfig::new(name).listen_addr("127.0.0.1:0".parse().unwrap());
    Coordinator::bind(config, Arc::new(ManualClock::new())).unwrap()
}

fn client() -> Transport {
    init_crypto();
    Transport::bind("127.0.0.1:0".parse().unwrap()).unwrap()
}

/// Test that one transport can address several nodes over cached connections
#[tokio::test]
async fn test_one_client_many_nodes() {
    let first = node("store-1");
    let second = node("store-2");
    let client = client();

    for (index, target) in [&first, &second].into_iter().enumerate() {
        let item = Item::new(format!("key-{}", index), "value");
        client
            .call(&target.addr(), Request::Store(StoreRequest::Write(WriteOp::Put, item)))
            .await
            .unwrap()
            .into_ack()
            .unwrap();
    }
    assert_eq!(client.connection_count(), 2);

    assert!(first.get(b"key-0").is_some());
    assert!(first.get(b"key-1").is_none());
    assert!(second.get(b"key-1").is_some());

    // Reuses the cached connection.
    let size = client
        .call(&first.addr(), Request::Store(StoreRequest::Size))
        .await
        .unwrap()
        .into_count()
        .unwrap();
    assert_eq!(size, 1);
    assert_eq!(client.connection_count(), 2);

    first.stop();
    second.stop();
}

/// Test that concurrent requests on one connection are all answered
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests() {
    let server = node("store-1");
    let client = Arc::new(client());
    let addr = server.addr();

    let calls = (0..20).map(|i| {
        let client = client.clone();
        let addr = addr.clone();
        async move {
            let item = Item::new(format!("key-{:02}", i), format!("value-{}", i));
            client
                .call(&addr, Request::Store(StoreRequest::Write(WriteOp::Put, item)))
                .await
                .and_then(Response::into_ack)
        }
    });
    let results = futures::future::join_all(calls).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(server.tree().size(), 20);

    server.stop();
}

/// Test that a stopped node answers nothing and is reported as a transport error
#[tokio::test]
async fn test_stopped_node_is_unreachable() {
    let server = node("store-1");
    let client = client();
    let addr = server.addr();

    client
        .call(&addr, Request::Membership(MembershipRequest::Nodes))
        .await
        .unwrap()
        .into_remotes()
        .unwrap();

    server.stop();
    let err = client
        .call(&addr, Request::Membership(MembershipRequest::Nodes))
        .await
        .unwrap_err();
    assert!(err.is_transport(), "{:?}", err);
}

/// Test that unresolvable addresses fail without dialing
#[tokio::test]
async fn test_unresolvable_address() {
    let client = client();
    let err = client
        .call("not-a-host.invalid:4100", Request::Membership(MembershipRequest::Nodes))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Transport { .. }));
    assert_eq!(client.connection_count(), 0);
}

/// Test request framing with bincode
#[test]
fn test_request_framing() {
    let request = Request::Store(StoreRequest::Write(WriteOp::SubPut, Item::sub("fruit", "apple", "red")));
    let frame = encode_message(&request).unwrap();

    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    assert_eq!(len, frame.len() - 4);

    let decoded: Request = decode_message(&frame[4..]).unwrap();
    match decoded {
        Request::Store(StoreRequest::Write(WriteOp::SubPut, item)) => {
            assert_eq!(item.key, b"fruit");
            assert_eq!(item.sub_key, b"apple");
            assert_eq!(item.value, b"red");
        }
        other => panic!("unexpected request {:?}", other),
    }
}
