//! End-to-end tests: client requests through the HTTP router, dispatched
//! over a real engine TCP connection, completed by the engine.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use faasgate_common::transport::{read_message, write_message};
use faasgate_common::{FuncConfig, GatewayMessage, MessageType};
use faasgate_gateway::engine::run_engine_listener;
use faasgate_gateway::http_server::client_router;
use faasgate_gateway::node_manager::NodeManager;
use faasgate_gateway::Dispatcher;
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;

const CONFIG: &str = r#"[ { "func_name": "hello", "func_id": 7 } ]"#;

fn dispatcher() -> Arc<Dispatcher> {
    let func_config = Arc::new(FuncConfig::load(CONFIG).unwrap());
    let node_manager = Arc::new(NodeManager::new(func_config.clone(), 0));
    Arc::new(Dispatcher::new(func_config, node_manager))
}

/// Starts the engine listener and an engine that uppercases every input.
async fn start_uppercase_engine(dispatcher: Arc<Dispatcher>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_engine_listener(listener, dispatcher.clone()));

    tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &GatewayMessage::engine_handshake(1, 0), b"")
            .await
            .unwrap();
        while let Ok(Some((msg, payload))) = read_message(&mut stream).await {
            assert_eq!(msg.message_type(), Some(MessageType::DispatchFuncCall));
            let output = payload.to_ascii_uppercase();
            let reply = GatewayMessage::func_call_complete(msg.func_call(), 100);
            write_message(&mut stream, &reply, &output).await.unwrap();
        }
    });

    for _ in 0..200 {
        if dispatcher.node_manager().node_count() == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("engine never registered");
}

fn post(uri: &str, body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_sync_call_through_router_and_engine() {
    let dispatcher = dispatcher();
    start_uppercase_engine(dispatcher.clone()).await;

    let response = client_router(dispatcher.clone())
        .oneshot(post("/function/hello", "hi"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"HI");
}

#[tokio::test]
async fn test_queued_async_call_drained_by_connecting_engine() {
    let dispatcher = dispatcher();

    // Submitted before any engine exists: accepted and parked.
    let response = client_router(dispatcher.clone())
        .oneshot(post("/function/hello?async=true", "fire"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // An engine connects; the queued call is drained with the retained
    // input and completes.
    start_uppercase_engine(dispatcher.clone()).await;
    for _ in 0..200 {
        let snapshot = dispatcher.stats_snapshot();
        if snapshot
            .per_func
            .get(&7)
            .map(|s| s.end2end_delay.count)
            .unwrap_or(0)
            == 1
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queued async call never completed");
}

#[tokio::test]
async fn test_sequential_calls_reuse_engine() {
    let dispatcher = dispatcher();
    start_uppercase_engine(dispatcher.clone()).await;

    for body in ["a", "b", "c"] {
        let response = client_router(dispatcher.clone())
            .oneshot(post("/function/hello", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let out = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&out[..], body.to_ascii_uppercase().as_bytes());
    }
    assert_eq!(dispatcher.stats_snapshot().incoming_requests, 3);
}
