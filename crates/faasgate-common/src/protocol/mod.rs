//! Wire protocol between the gateway and engine nodes.
//!
//! Every message on an engine connection is a fixed-size header
//! ([`GatewayMessage`], [`MESSAGE_HEADER_SIZE`] bytes, little-endian) followed
//! by exactly `payload_size` bytes of inline payload. The four-field
//! [`FuncCall`] identifier is embedded in the header for the message types
//! that refer to an invocation.

pub mod error;

use std::fmt;

/// Size in bytes of the fixed [`GatewayMessage`] header.
pub const MESSAGE_HEADER_SIZE: usize = 22;

/// Upper bound on `payload_size`, enforced by the transport layer before
/// allocating a receive buffer.
pub const MAX_PAYLOAD_SIZE: usize = 100 * 1024 * 1024;

/// Identifier of one function invocation.
///
/// The four 16-bit components pack into a 64-bit `full_call_id`, the primary
/// key used to track the invocation across the gateway and engines.
/// `method_id` is zero unless the function is a gRPC service; `client_id` is
/// reserved and always zero on gateway-originated calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FuncCall {
    pub func_id: u16,
    pub method_id: u16,
    pub client_id: u16,
    pub call_id: u16,
}

impl FuncCall {
    pub fn new(func_id: u16, client_id: u16, call_id: u16) -> Self {
        Self {
            func_id,
            method_id: 0,
            client_id,
            call_id,
        }
    }

    pub fn with_method(func_id: u16, method_id: u16, client_id: u16, call_id: u16) -> Self {
        Self {
            func_id,
            method_id,
            client_id,
            call_id,
        }
    }

    /// Packs the four components into the 64-bit primary key.
    pub fn full_call_id(&self) -> u64 {
        (self.func_id as u64)
            | (self.method_id as u64) << 16
            | (self.client_id as u64) << 32
            | (self.call_id as u64) << 48
    }

    pub fn from_full_call_id(id: u64) -> Self {
        Self {
            func_id: id as u16,
            method_id: (id >> 16) as u16,
            client_id: (id >> 32) as u16,
            call_id: (id >> 48) as u16,
        }
    }
}

impl fmt::Display for FuncCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.method_id == 0 {
            write!(
                f,
                "func_id={}, client_id={}, call_id={}",
                self.func_id, self.client_id, self.call_id
            )
        } else {
            write!(
                f,
                "func_id={}, method_id={}, client_id={}, call_id={}",
                self.func_id, self.method_id, self.client_id, self.call_id
            )
        }
    }
}

/// Tag identifying what a [`GatewayMessage`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// First message on every engine connection; carries `(node_id, conn_id)`.
    EngineHandshake = 1,
    /// Gateway -> engine: run this invocation, input is the payload.
    DispatchFuncCall = 2,
    /// Engine -> gateway: invocation finished, output is the payload.
    FuncCallComplete = 3,
    /// Engine -> gateway: invocation failed.
    FuncCallFailed = 4,
}

impl MessageType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::EngineHandshake),
            2 => Some(Self::DispatchFuncCall),
            3 => Some(Self::FuncCallComplete),
            4 => Some(Self::FuncCallFailed),
            _ => None,
        }
    }
}

/// Fixed-size message header exchanged between gateway and engines.
///
/// Field order matches the wire layout; see [`GatewayMessage::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GatewayMessage {
    pub message_type: u16,
    pub node_id: u16,
    pub conn_id: u16,
    pub func_id: u16,
    pub method_id: u16,
    pub client_id: u16,
    pub call_id: u16,
    pub payload_size: u32,
    /// Engine-reported execution time in microseconds. Untrusted.
    pub processing_time: u32,
}

impl GatewayMessage {
    pub fn engine_handshake(node_id: u16, conn_id: u16) -> Self {
        Self {
            message_type: MessageType::EngineHandshake as u16,
            node_id,
            conn_id,
            ..Default::default()
        }
    }

    pub fn dispatch_func_call(func_call: FuncCall) -> Self {
        Self {
            message_type: MessageType::DispatchFuncCall as u16,
            ..Self::with_func_call(func_call)
        }
    }

    pub fn func_call_complete(func_call: FuncCall, processing_time: u32) -> Self {
        Self {
            message_type: MessageType::FuncCallComplete as u16,
            processing_time,
            ..Self::with_func_call(func_call)
        }
    }

    pub fn func_call_failed(func_call: FuncCall, processing_time: u32) -> Self {
        Self {
            message_type: MessageType::FuncCallFailed as u16,
            processing_time,
            ..Self::with_func_call(func_call)
        }
    }

    fn with_func_call(func_call: FuncCall) -> Self {
        Self {
            func_id: func_call.func_id,
            method_id: func_call.method_id,
            client_id: func_call.client_id,
            call_id: func_call.call_id,
            ..Default::default()
        }
    }

    /// The message tag, or `None` for tags this gateway does not know.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u16(self.message_type)
    }

    /// Extracts the invocation identifier embedded in the header.
    pub fn func_call(&self) -> FuncCall {
        FuncCall {
            func_id: self.func_id,
            method_id: self.method_id,
            client_id: self.client_id,
            call_id: self.call_id,
        }
    }

    /// Serializes the header into its little-endian wire layout.
    pub fn encode(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut buf = [0u8; MESSAGE_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.message_type.to_le_bytes());
        buf[2..4].copy_from_slice(&self.node_id.to_le_bytes());
        buf[4..6].copy_from_slice(&self.conn_id.to_le_bytes());
        buf[6..8].copy_from_slice(&self.func_id.to_le_bytes());
        buf[8..10].copy_from_slice(&self.method_id.to_le_bytes());
        buf[10..12].copy_from_slice(&self.client_id.to_le_bytes());
        buf[12..14].copy_from_slice(&self.call_id.to_le_bytes());
        buf[14..18].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[18..22].copy_from_slice(&self.processing_time.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; MESSAGE_HEADER_SIZE]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            message_type: u16_at(0),
            node_id: u16_at(2),
            conn_id: u16_at(4),
            func_id: u16_at(6),
            method_id: u16_at(8),
            client_id: u16_at(10),
            call_id: u16_at(12),
            payload_size: u32_at(14),
            processing_time: u32_at(18),
        }
    }
}
