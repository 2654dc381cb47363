use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{spawn, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

use crate::{
    negotiation::{AgentEvent, AgentEventSender},
    signaling_server::{ClientEvent, ServerEvent},
};

use super::RelaySocket;

/// Relay connection over a websocket speaking `{"event", "data"}` text frames.
pub struct WebSocketSocket {
    outgoing_tx: Option<mpsc::UnboundedSender<ClientEvent>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl WebSocketSocket {
    pub async fn connect(url: &str, events: AgentEventSender) -> Result<Self> {
        let (stream, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to relay {}", url))?;
        debug!("relay connected: {}", url);
        let (mut ws_write, mut ws_read) = stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let writer = spawn(async move {
            while let Some(event) = outgoing_rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode relay frame: {}", err);
                        continue;
                    }
                };
                trace!("relay <- {}", text);
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_events = events.clone();
        let reader = spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        trace!("relay -> {}", text);
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                if reader_events.send(AgentEvent::Relay(event)).is_err() {
                                    return;
                                }
                            }
                            Err(err) => debug!("ignored relay frame: {}", err),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!("relay websocket closed: {}", err);
                        break;
                    }
                }
            }
            let _ = reader_events.send(AgentEvent::RelayClosed);
        });

        events
            .send(AgentEvent::RelayConnected)
            .context("Event queue closed")?;
        Ok(Self {
            outgoing_tx: Some(outgoing_tx),
            writer,
            reader,
        })
    }
}

#[async_trait]
impl RelaySocket for WebSocketSocket {
    async fn emit(&mut self, event: ClientEvent) -> Result<()> {
        self.outgoing_tx
            .as_ref()
            .context("Relay socket already disconnected")?
            .send(event)
            .context("Relay writer stopped")?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        // Pending frames (remove-call) are flushed before the writer closes.
        self.outgoing_tx.take();
        self.reader.abort();
        (&mut self.writer)
            .await
            .context("Relay writer panicked")?;
        debug!("relay disconnected");
        Ok(())
    }
}

impl Drop for WebSocketSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
