//! tasknet-core: protocol messages, wire framing, identity and config.
//! All other tasknet crates depend on this one.

pub mod config;
pub mod crypto;
pub mod message;
pub mod task;
pub mod wire;

pub use message::{Message, MessageKind, Signed};
