//! Integration tests for the service client over real sockets.
//!
//! A small echo peer listens on TCP or a Unix socket and answers every
//! session opened by the client with one chunk and a choke.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hearth_core::{AsyncSocket, Endpoint, Listener, Service, ServiceError, StaticResolver};
use hearth_proto::{Dialect, MessageCodec, Payload, TraceInfo};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

async fn serve_echo(listener: Box<dyn Listener>) {
    let conn = listener.accept().await.unwrap();
    let mut frames = Framed::new(conn, MessageCodec::new());
    while let Some(Ok(message)) = frames.next().await {
        let body = message.payload().first_bytes().unwrap_or_default();
        frames
            .send(Dialect::V1.chunk(message.session(), &body))
            .await
            .unwrap();
        frames.send(Dialect::V1.choke(message.session())).await.unwrap();
    }
}

#[tokio::test]
async fn call_through_resolver_over_tcp() {
    let listener = Endpoint::tcp("127.0.0.1:0".parse().unwrap())
        .bind()
        .await
        .unwrap();
    let endpoint = listener.local_endpoint().unwrap();
    let server = tokio::spawn(serve_echo(listener));

    let resolver = StaticResolver::new().with("echo", vec![endpoint.clone()]);
    let service = Service::connect("echo", &resolver, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(service.endpoint(), Some(&endpoint));
    assert_eq!(service.name(), "echo");

    let cancel = CancellationToken::new();
    let mut channel = service
        .call(0, Payload::builder().str("hello").build())
        .unwrap();

    let chunk = channel.get(&cancel).await.unwrap();
    assert_eq!(chunk.ty(), 0);
    assert_eq!(&chunk.payload().first_bytes().unwrap()[..], b"hello");
    let choke = channel.get(&cancel).await.unwrap();
    assert_eq!(choke.ty(), 2);

    service.close();
    assert!(matches!(
        channel.get(&cancel).await,
        Err(ServiceError::Disconnected)
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn unreachable_service_fails_to_connect() {
    let dir = tempfile::tempdir().unwrap();
    let resolver =
        StaticResolver::new().with("gone", vec![Endpoint::unix(dir.path().join("gone.sock"))]);

    let err = Service::connect("gone", &resolver, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Transport(_)));

    let err = Service::connect("unknown", &resolver, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Resolve(_)));
}

#[tokio::test]
async fn trace_headers_reach_the_peer() {
    let dir = tempfile::tempdir().unwrap();
    let listener = Endpoint::unix(dir.path().join("traced.sock"))
        .bind()
        .await
        .unwrap();
    let endpoint = listener.local_endpoint().unwrap();

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let mut socket = AsyncSocket::new(conn);
        socket.recv().await
    });

    let resolver = StaticResolver::new().with("traced", vec![endpoint]);
    let service = Service::connect("traced", &resolver, Duration::from_secs(1))
        .await
        .unwrap();
    let trace = TraceInfo {
        trace: 7,
        span: 8,
        parent: 0,
    };
    let _channel = service
        .call_with_headers(4, Payload::empty(), trace.into())
        .unwrap();

    let received = server.await.unwrap().unwrap();
    assert_eq!(received.ty(), 4);
    assert_eq!(received.headers().and_then(|h| h.trace_info()), Some(trace));
}
