use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::{spawn, task::JoinHandle};

use crate::{
    negotiation::{AgentEvent, AgentEventSender},
    signaling_server::{
        relay::{ConnectionId, Relay},
        ClientEvent,
    },
};

use super::RelaySocket;

/// In-process link to a [`Relay`], without a network hop.
pub struct ChannelSocket {
    relay: Arc<Relay>,
    conn: Option<ConnectionId>,
    forwarder: JoinHandle<()>,
}

impl ChannelSocket {
    pub async fn connect(relay: Arc<Relay>, events: AgentEventSender) -> Result<Self> {
        let (conn, mut rx) = relay.connect().await;
        let forwarder_events = events.clone();
        let forwarder = spawn(async move {
            while let Some(event) = rx.recv().await {
                if forwarder_events.send(AgentEvent::Relay(event)).is_err() {
                    return;
                }
            }
            let _ = forwarder_events.send(AgentEvent::RelayClosed);
        });
        events
            .send(AgentEvent::RelayConnected)
            .context("Event queue closed")?;
        Ok(Self {
            relay,
            conn: Some(conn),
            forwarder,
        })
    }
}

#[async_trait]
impl RelaySocket for ChannelSocket {
    async fn emit(&mut self, event: ClientEvent) -> Result<()> {
        let conn = self.conn.context("Relay socket already disconnected")?;
        self.relay.handle(conn, event).await;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            self.relay.disconnect(conn).await;
        }
        Ok(())
    }
}

impl Drop for ChannelSocket {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}
