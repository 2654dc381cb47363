pub mod call_id;
pub mod connection;
pub mod media;
pub mod negotiation;
pub mod signaling_server;

pub use crate::call_id::CallId;
