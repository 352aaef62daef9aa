//! Wisp v1 client: packet codec, connection multiplexor and byte streams.

mod mux;
mod packet;
mod stream;

pub use mux::Multiplexor;
pub use packet::{CloseReason, DecodeError, Packet, Payload, StreamType};
pub use stream::{StreamHandle, WispStream};
