//! Shared protocol, transport, and configuration types for the faasgate
//! FaaS gateway.
//!
//! This crate defines everything the gateway and its engine nodes must agree
//! on: the [`protocol::FuncCall`] identifier, the fixed-size
//! [`protocol::GatewayMessage`] wire envelope, the framed TCP transport, and
//! the function-configuration file format.

pub mod func_config;
pub mod protocol;
pub mod time;
pub mod transport;

pub use func_config::{FuncConfig, FuncEntry};
pub use protocol::error::{GatewayError, Result};
pub use protocol::{FuncCall, GatewayMessage, MessageType};
