use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{
    spawn,
    sync::{mpsc, oneshot},
    time::{sleep, Instant},
};
use tracing::{debug, warn};
use webrtc::data_channel::{data_channel_state::RTCDataChannelState, RTCDataChannel};

use crate::negotiation::{AgentEvent, AgentEventSender};

pub const SIGNALLING_CHANNEL_LABEL: &str = "signalling";

const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
const FLUSH_POLL: Duration = Duration::from_millis(10);

type Outgoing = (String, oneshot::Sender<Result<()>>);

/// The direct signalling channel. Open, message and close callbacks are
/// reported on the session queue.
pub struct DataChannel {
    rtc: Arc<RTCDataChannel>,
    message_sender: mpsc::Sender<Outgoing>,
}

impl DataChannel {
    pub async fn new(rtc: Arc<RTCDataChannel>, events: AgentEventSender) -> Self {
        let (message_sender, mut outgoing_message_receiver) = mpsc::channel::<Outgoing>(16);
        {
            let events = events.clone();
            rtc.on_open(Box::new(move || {
                let _ = events.send(AgentEvent::DataChannelOpen);
                Box::pin(async {})
            }));
        }
        {
            let events = events.clone();
            rtc.on_message(Box::new(move |msg| {
                let text = String::from_utf8_lossy(&msg.data).into_owned();
                let _ = events.send(AgentEvent::ChannelMessage(text));
                Box::pin(async {})
            }));
        }
        rtc.on_error(Box::new(|err| {
            warn!("signalling channel error: {}", err);
            Box::pin(async {})
        }));
        rtc.on_close(Box::new(move || {
            let _ = events.send(AgentEvent::DataChannelClosed);
            Box::pin(async {})
        }));

        {
            // NOTE: Outgoing text is written by a dedicated task; each sender
            //       waits for its own write to finish.
            let rtc = rtc.clone();
            spawn(async move {
                while let Some((text, done)) = outgoing_message_receiver.recv().await {
                    let result = rtc.send_text(text).await;
                    let closed = matches!(result, Err(webrtc::Error::ErrClosedPipe));
                    let _ = done.send(result.map(|_| ()).map_err(|err| anyhow!(err)));
                    if closed {
                        return;
                    }
                }
            });
        }

        Self {
            rtc,
            message_sender,
        }
    }

    pub fn label(&self) -> &str {
        self.rtc.label()
    }

    pub fn is_open(&self) -> bool {
        self.rtc.ready_state() == RTCDataChannelState::Open
    }

    /// Resolves once the text has been handed to the SCTP stream.
    pub async fn send(&self, text: String) -> Result<()> {
        let (done, written) = oneshot::channel();
        self.message_sender
            .send((text, done))
            .await
            .context("Signalling channel sender stopped")?;
        written
            .await
            .context("Signalling channel sender stopped")?
            .context("Failed to write on signalling channel")
    }

    /// Waits until the peer has acknowledged everything written so far.
    pub async fn flush(&self) {
        let deadline = Instant::now() + FLUSH_TIMEOUT;
        while self.is_open() && self.rtc.buffered_amount().await > 0 {
            if Instant::now() >= deadline {
                warn!("signalling channel not drained before close");
                return;
            }
            sleep(FLUSH_POLL).await;
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.flush().await;
        debug!("closing signalling channel");
        Ok(self.rtc.close().await?)
    }
}
