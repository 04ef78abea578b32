//! Client-facing HTTP surface.
//!
//! Two routers: the main client router (`POST /function/{name}`, metrics,
//! health) and the gRPC-mapped router (`POST /{service}/{method}`), served on
//! their respective ports. Handlers only parse the request into a
//! [`FuncCallContext`] and hand it to the dispatcher; the dispatch semantics
//! live entirely in [`crate::dispatcher`].

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use bytes::Bytes;
use faasgate_common::FuncCall;
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::context::{CallStatus, ClientKind, FuncCallContext};
use crate::dispatcher::Dispatcher;

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
}

/// Router for client HTTP traffic.
pub fn client_router(dispatcher: Arc<Dispatcher>) -> axum::Router {
    axum::Router::new()
        .route("/function/{name}", post(invoke_function))
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .with_state(AppState { dispatcher })
}

/// Router for the gRPC-mapped port: `POST /{service}/{method}`.
pub fn grpc_router(dispatcher: Arc<Dispatcher>) -> axum::Router {
    axum::Router::new()
        .route("/{service}/{method}", post(invoke_grpc))
        .with_state(AppState { dispatcher })
}

#[derive(Deserialize)]
struct InvokeQuery {
    /// `?async=true` makes the call fire-and-forget.
    #[serde(default, rename = "async")]
    is_async: bool,
}

async fn invoke_function(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<InvokeQuery>,
    body: Bytes,
) -> Response {
    let ctx = FuncCallContext::http(name, body, query.is_async);
    run_call(state.dispatcher, ClientKind::Http, ctx).await
}

async fn invoke_grpc(
    State(state): State<AppState>,
    Path((service, method)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let ctx = FuncCallContext::grpc(service, method, body);
    run_call(state.dispatcher, ClientKind::Grpc, ctx).await
}

async fn metrics(State(state): State<AppState>) -> Response {
    Json(state.dispatcher.stats_snapshot()).into_response()
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Submits one invocation and waits for its terminal status.
///
/// If the client disconnects mid-wait, axum drops this future; the guard then
/// discards the outstanding call and removes the connection, so the result is
/// suppressed when the engine eventually replies.
async fn run_call(dispatcher: Arc<Dispatcher>, kind: ClientKind, ctx: FuncCallContext) -> Response {
    let (conn_id, mut completions) = dispatcher.register_connection(kind);
    let mut guard = ConnectionGuard {
        dispatcher: dispatcher.clone(),
        conn_id,
        outstanding: None,
    };
    guard.outstanding = dispatcher.on_new_call(conn_id, ctx);

    let Some(mut finished) = completions.recv().await else {
        // The table owns the only sender; it cannot drop while the
        // connection is registered.
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    guard.outstanding = None;

    match finished.status() {
        CallStatus::Success if finished.is_async => StatusCode::ACCEPTED.into_response(),
        CallStatus::Success => finished.take_output().into_response(),
        CallStatus::NotFound => StatusCode::NOT_FOUND.into_response(),
        CallStatus::Failed | CallStatus::Pending => {
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Discards the outstanding call (if any) and unregisters the connection
/// when the request task ends, normally or by cancellation.
struct ConnectionGuard {
    dispatcher: Arc<Dispatcher>,
    conn_id: u64,
    outstanding: Option<FuncCall>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(func_call) = self.outstanding {
            self.dispatcher.discard_call(func_call);
        }
        self.dispatcher.unregister_connection(self.conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use faasgate_common::{FuncConfig, GatewayMessage, MessageType};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::node_manager::{EngineSender, NodeManager};

    fn dispatcher() -> Arc<Dispatcher> {
        let func_config =
            Arc::new(FuncConfig::load(r#"[ { "func_name": "hello", "func_id": 7 } ]"#).unwrap());
        let node_manager = Arc::new(NodeManager::new(func_config.clone(), 0));
        Arc::new(Dispatcher::new(func_config, node_manager))
    }

    fn post(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let response = client_router(dispatcher())
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_function_is_404() {
        let response = client_router(dispatcher())
            .oneshot(post("/function/bye", "hi"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_async_accepted_without_engines() {
        let dispatcher = dispatcher();
        let response = client_router(dispatcher.clone())
            .oneshot(post("/function/hello?async=true", "fire"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_sync_call_round_trip() {
        let dispatcher = dispatcher();
        let (tx, mut engine): (EngineSender, _) = mpsc::unbounded_channel();
        dispatcher.node_manager().register_link(1, 0, tx);

        let request_task = tokio::spawn(
            client_router(dispatcher.clone()).oneshot(post("/function/hello", "hi")),
        );

        let (msg, payload) = engine.recv().await.unwrap();
        assert_eq!(msg.message_type(), Some(MessageType::DispatchFuncCall));
        assert_eq!(&payload[..], b"hi");
        dispatcher.on_engine_message(
            1,
            &GatewayMessage::func_call_complete(msg.func_call(), 42),
            Bytes::from_static(b"HI"),
        );

        let response = request_task.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"HI");
    }

    #[tokio::test]
    async fn test_engine_failure_maps_to_500() {
        let dispatcher = dispatcher();
        let (tx, mut engine): (EngineSender, _) = mpsc::unbounded_channel();
        dispatcher.node_manager().register_link(1, 0, tx);

        let request_task = tokio::spawn(
            client_router(dispatcher.clone()).oneshot(post("/function/hello", "boom")),
        );
        let (msg, _payload) = engine.recv().await.unwrap();
        dispatcher.on_engine_message(
            1,
            &GatewayMessage::func_call_failed(msg.func_call(), 0),
            Bytes::new(),
        );

        let response = request_task.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_grpc_router_unknown_service_is_404() {
        let response = grpc_router(dispatcher())
            .oneshot(post("/Greeter/SayHello", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_snapshot_served() {
        let dispatcher = dispatcher();
        // One rejected call still counts nothing; submit a pending call.
        let response = client_router(dispatcher.clone())
            .oneshot(post("/function/hello?async=true", "x"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = client_router(dispatcher)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let snapshot: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot["incoming_requests"], 1);
        assert!(snapshot["per_func"]["7"].is_object());
    }
}
