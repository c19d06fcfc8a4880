//! Control-channel wire layer: message types, frame codec, socket transport.

pub mod codec;
pub mod protocol;
pub mod transport;
