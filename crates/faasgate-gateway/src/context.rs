//! Per-invocation call context and the client-connection handle used to hand
//! results back.

use bytes::Bytes;
use faasgate_common::FuncCall;
use tokio::sync::mpsc;
use tracing::debug;

/// Terminal (or not-yet-terminal) status of an invocation as seen by the
/// client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Pending,
    Success,
    Failed,
    NotFound,
}

/// Which protocol surface produced a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Http,
    Grpc,
}

/// One invocation as produced by the HTTP/gRPC layer.
///
/// The context is moved into the dispatcher on submission and moved back to
/// the client task (through its [`ClientHandle`] channel) once the call
/// reaches a terminal status.
#[derive(Debug)]
pub struct FuncCallContext {
    pub func_name: String,
    /// Set for gRPC-mapped invocations only.
    pub method_name: Option<String>,
    pub input: Bytes,
    pub is_async: bool,
    status: CallStatus,
    output: Vec<u8>,
    func_call: Option<FuncCall>,
}

impl FuncCallContext {
    pub fn http(func_name: impl Into<String>, input: Bytes, is_async: bool) -> Self {
        Self {
            func_name: func_name.into(),
            method_name: None,
            input,
            is_async,
            status: CallStatus::Pending,
            output: Vec::new(),
            func_call: None,
        }
    }

    pub fn grpc(service: impl Into<String>, method: impl Into<String>, input: Bytes) -> Self {
        Self {
            func_name: service.into(),
            method_name: Some(method.into()),
            input,
            is_async: false,
            status: CallStatus::Pending,
            output: Vec::new(),
            func_call: None,
        }
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn set_status(&mut self, status: CallStatus) {
        self.status = status;
    }

    pub fn append_output(&mut self, payload: &[u8]) {
        self.output.extend_from_slice(payload);
    }

    pub fn take_output(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.output))
    }

    /// The identifier assigned by the dispatcher, once submitted.
    pub fn func_call(&self) -> Option<FuncCall> {
        self.func_call
    }

    pub(crate) fn set_func_call(&mut self, func_call: FuncCall) {
        self.func_call = Some(func_call);
    }
}

/// Completion channel for one client connection.
///
/// The call table owns the handle (keyed by connection id); the client task
/// holds the receiving end and awaits its finished contexts. Dropping the
/// receiver makes later completions no-ops, which is exactly the discard
/// semantics a vanished client needs.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub kind: ClientKind,
    completions: mpsc::UnboundedSender<FuncCallContext>,
}

impl ClientHandle {
    pub fn channel(kind: ClientKind) -> (Self, mpsc::UnboundedReceiver<FuncCallContext>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                kind,
                completions: tx,
            },
            rx,
        )
    }

    /// Delivers a finished context to the owning client task.
    pub fn finish(&self, ctx: FuncCallContext) {
        if self.completions.send(ctx).is_err() {
            debug!("Client connection closed before completion could be delivered");
        }
    }
}
