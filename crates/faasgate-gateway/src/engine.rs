//! TCP listener and framed links for engine connections.
//!
//! Engines connect back to the gateway on the engine-connection port. The
//! first frame on every connection must be an `EngineHandshake` carrying
//! `(node_id, conn_id)`; anything else closes the socket. After the
//! handshake, a writer task drains the link's outbound channel (making
//! `send_message` non-blocking and sends atomic per frame) while this task
//! reads inbound messages into the dispatcher.

use std::sync::Arc;

use bytes::Bytes;
use faasgate_common::transport::{read_message, write_message};
use faasgate_common::{GatewayError, GatewayMessage, MessageType, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;

/// Accept loop for the engine-connection port. Runs until the listener
/// fails.
pub async fn run_engine_listener(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Result<()> {
    loop {
        let (stream, peer_addr) = listener
            .accept()
            .await
            .map_err(|e| GatewayError::Connection(format!("Engine accept failed: {}", e)))?;
        debug!("Engine connection attempt from {peer_addr}");
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_engine_connection(stream, dispatcher).await {
                warn!("Engine connection error: {e}");
            }
        });
    }
}

async fn handle_engine_connection(stream: TcpStream, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let handshake = match read_message(&mut reader).await? {
        Some((message, _payload)) => message,
        None => {
            return Err(GatewayError::Handshake(
                "Engine closed before handshake".to_string(),
            ))
        }
    };
    if handshake.message_type() != Some(MessageType::EngineHandshake) {
        return Err(GatewayError::Handshake(format!(
            "Unexpected engine handshake message type {}",
            handshake.message_type
        )));
    }
    let node_id = handshake.node_id;
    let conn_id = handshake.conn_id;

    // All outbound traffic for this link funnels through one writer task, so
    // concurrent senders never interleave frames.
    let (tx, mut rx) = mpsc::unbounded_channel::<(GatewayMessage, Bytes)>();
    tokio::spawn(async move {
        while let Some((message, payload)) = rx.recv().await {
            if let Err(e) = write_message(&mut writer, &message, &payload).await {
                warn!("Engine link write failed (node_id={node_id}, conn_id={conn_id}): {e}");
                break;
            }
        }
    });

    dispatcher.node_manager().register_link(node_id, conn_id, tx);
    info!("New engine connection (node_id={node_id}, conn_id={conn_id})");
    dispatcher.on_node_available(node_id);

    let result = loop {
        match read_message(&mut reader).await {
            Ok(Some((message, payload))) => {
                dispatcher.on_engine_message(node_id, &message, payload)
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    // Dropping the registered sender stops the writer task.
    dispatcher.node_manager().unregister_link(node_id, conn_id);
    warn!("EngineConnection (node_id={node_id}, conn_id={conn_id}) disconnected");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use faasgate_common::{FuncCall, FuncConfig};
    use std::time::Duration;

    use crate::node_manager::NodeManager;

    fn dispatcher() -> Arc<Dispatcher> {
        let func_config =
            Arc::new(FuncConfig::load(r#"[ { "func_name": "hello", "func_id": 7 } ]"#).unwrap());
        let node_manager = Arc::new(NodeManager::new(func_config.clone(), 0));
        Arc::new(Dispatcher::new(func_config, node_manager))
    }

    async fn wait_for_node_count(dispatcher: &Dispatcher, expected: usize) {
        for _ in 0..200 {
            if dispatcher.node_manager().node_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "node_count never reached {expected}, still {}",
            dispatcher.node_manager().node_count()
        );
    }

    #[tokio::test]
    async fn test_handshake_registers_and_disconnect_retires() {
        let dispatcher = dispatcher();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_engine_listener(listener, dispatcher.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &GatewayMessage::engine_handshake(3, 0), b"")
            .await
            .unwrap();
        wait_for_node_count(&dispatcher, 1).await;

        drop(stream);
        wait_for_node_count(&dispatcher, 0).await;
    }

    #[tokio::test]
    async fn test_non_handshake_first_frame_rejected() {
        let dispatcher = dispatcher();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_engine_listener(listener, dispatcher.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let bogus = GatewayMessage::func_call_complete(FuncCall::new(7, 0, 1), 0);
        write_message(&mut stream, &bogus, b"").await.unwrap();

        // The gateway closes the connection without registering a node.
        let closed = read_message(&mut stream).await.unwrap();
        assert!(closed.is_none());
        assert_eq!(dispatcher.node_manager().node_count(), 0);
    }
}
