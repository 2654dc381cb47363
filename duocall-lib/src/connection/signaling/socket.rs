pub mod channel_socket;
pub mod websocket_socket;

use anyhow::Result;
use async_trait::async_trait;

use crate::signaling_server::ClientEvent;

pub use channel_socket::ChannelSocket;
pub use websocket_socket::WebSocketSocket;

/// Outbound half of a relay connection. Inbound frames are delivered as
/// `AgentEvent::Relay` on the session queue.
#[async_trait]
pub trait RelaySocket: Send {
    async fn emit(&mut self, event: ClientEvent) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
}
