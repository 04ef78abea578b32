//! Framed transport for [`GatewayMessage`](crate::protocol::GatewayMessage)
//! envelopes over byte streams.

mod frame;

pub use frame::{read_message, write_message};
