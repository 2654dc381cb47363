use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::{sync::Mutex, task::JoinHandle, time::interval};
use tracing::{debug, trace};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8},
        APIBuilder,
    },
    data_channel::RTCDataChannel,
    ice_transport::{ice_candidate::RTCIceCandidate, ice_server::RTCIceServer},
    interceptor::registry::Registry,
    media::Sample,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
        signaling_state::RTCSignalingState, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
        rtp_sender::RTCRtpSender,
    },
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

use crate::{
    connection::signaling::{IceCandidate, SessionDescription},
    media::{LocalTrack, RemoteTrack, TrackKind},
    negotiation::{AgentEvent, AgentEventSender, ConnectionState, PeerTransport},
};

use super::data_channel::{DataChannel, SIGNALLING_CHANNEL_LABEL};

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

fn create_config(ice_servers: &[String]) -> RTCConfiguration {
    if ice_servers.is_empty() {
        return RTCConfiguration::default();
    }
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: ice_servers.to_vec(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

async fn create_peer_connection(ice_servers: &[String]) -> Result<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build()
        .new_peer_connection(create_config(ice_servers))
        .await?)
}

fn codec_of(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(100);
/// Opus silence frame.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
/// Header-only 16x16 VP8 key frame.
const VP8_PLACEHOLDER: &[u8] = &[0x10, 0x00, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];

/// Keeps a track without a capture source sending, so the remote side
/// sees it arrive.
fn spawn_placeholder_feed(track: Arc<TrackLocalStaticSample>, kind: TrackKind) -> JoinHandle<()> {
    let (data, duration) = match kind {
        TrackKind::Audio => (OPUS_SILENCE, AUDIO_FRAME),
        TrackKind::Video => (VP8_PLACEHOLDER, VIDEO_FRAME),
    };
    tokio::spawn(async move {
        let mut ticker = interval(duration);
        loop {
            ticker.tick().await;
            let sample = Sample {
                data: Bytes::from_static(data),
                duration,
                ..Default::default()
            };
            if let Err(err) = track.write_sample(&sample).await {
                debug!("placeholder feed stopped: {}", err);
                return;
            }
        }
    })
}

fn remote_track_of(track: &TrackRemote) -> RemoteTrack {
    let kind = match track.kind() {
        RTPCodecType::Video => TrackKind::Video,
        _ => TrackKind::Audio,
    };
    RemoteTrack::new(track.stream_id(), track.id(), kind)
}

fn connection_state_of(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

async fn accept_data_channel(
    slot: &Mutex<Option<DataChannel>>,
    rtc_data_channel: Arc<RTCDataChannel>,
    events: AgentEventSender,
) {
    if rtc_data_channel.label() != SIGNALLING_CHANNEL_LABEL {
        debug!("ignored data channel {:?}", rtc_data_channel.label());
        return;
    }
    let data_channel = DataChannel::new(rtc_data_channel, events.clone()).await;
    *slot.lock().await = Some(data_channel);
    let _ = events.send(AgentEvent::IncomingDataChannel);
}

/// [`PeerTransport`] over a real `RTCPeerConnection`.
pub struct PeerConnection {
    rtc: Option<Arc<RTCPeerConnection>>,
    data_channel: Arc<Mutex<Option<DataChannel>>>,
    events: AgentEventSender,
    senders: HashMap<String, Arc<RTCRtpSender>>,
    placeholder_samples: bool,
    feeds: HashMap<String, JoinHandle<()>>,
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        trace!("drop connection");
        for (_, feed) in self.feeds.drain() {
            feed.abort();
        }
        let Some(rtc) = self.rtc.take() else {
            return;
        };
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        rt.spawn(async move {
            // NOTE: An established connection is not closed by drop.
            let _ = rtc.close().await;
            trace!("connection closed");
        });
    }
}

impl PeerConnection {
    pub async fn new(ice_servers: &[String], events: AgentEventSender) -> Result<Self> {
        let rtc = Arc::new(create_peer_connection(ice_servers).await?);
        let data_channel = Arc::new(Mutex::new(None));

        {
            let events = events.clone();
            rtc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let candidate = match candidate.map(|x| x.to_json()).transpose() {
                        Ok(candidate) => candidate.map(IceCandidate::from),
                        Err(err) => {
                            debug!("unserializable candidate: {}", err);
                            return;
                        }
                    };
                    let _ = events.send(AgentEvent::LocalCandidate(candidate));
                })
            }));
        }
        {
            let events = events.clone();
            rtc.on_negotiation_needed(Box::new(move || {
                let _ = events.send(AgentEvent::NegotiationNeeded);
                Box::pin(async {})
            }));
        }
        {
            let events = events.clone();
            let data_channel = data_channel.clone();
            rtc.on_data_channel(Box::new(move |rtc_data_channel| {
                let events = events.clone();
                let data_channel = data_channel.clone();
                Box::pin(async move {
                    accept_data_channel(&data_channel, rtc_data_channel, events).await;
                })
            }));
        }
        {
            let events = events.clone();
            rtc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let events = events.clone();
                Box::pin(async move {
                    let remote = remote_track_of(&track);
                    let _ = events.send(AgentEvent::RemoteTrackAdded(remote.clone()));
                    // NOTE: webrtc-rs has no removetrack event; the read loop
                    //       ends when the sender goes away.
                    tokio::spawn(async move {
                        while track.read_rtp().await.is_ok() {}
                        let _ = events.send(AgentEvent::RemoteTrackRemoved(remote));
                    });
                })
            }));
        }
        {
            let events = events.clone();
            rtc.on_peer_connection_state_change(Box::new(move |state| {
                debug!("on_peer_connection_state_change {}", state);
                let _ = events.send(AgentEvent::ConnectionStateChanged(connection_state_of(
                    state,
                )));
                Box::pin(async {})
            }));
        }

        Ok(Self {
            rtc: Some(rtc),
            data_channel,
            events,
            senders: HashMap::new(),
            placeholder_samples: false,
            feeds: HashMap::new(),
        })
    }

    /// Local tracks get silence or blank frames written to them.
    pub fn with_placeholder_samples(mut self) -> Self {
        self.placeholder_samples = true;
        self
    }

    fn rtc(&self) -> Result<&Arc<RTCPeerConnection>> {
        self.rtc.as_ref().ok_or_else(|| anyhow!("Peer connection closed"))
    }
}

#[async_trait]
impl PeerTransport for PeerConnection {
    async fn create_signalling_channel(&mut self) -> Result<()> {
        let rtc_data_channel = self
            .rtc()?
            .create_data_channel(SIGNALLING_CHANNEL_LABEL, None)
            .await?;
        let data_channel = DataChannel::new(rtc_data_channel, self.events.clone()).await;
        *self.data_channel.lock().await = Some(data_channel);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription> {
        self.rtc()?.create_offer(None).await?.try_into()
    }

    async fn create_answer(&mut self) -> Result<SessionDescription> {
        self.rtc()?.create_answer(None).await?.try_into()
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<()> {
        let desc = RTCSessionDescription::try_from(desc)?;
        self.rtc()?.set_local_description(desc).await?;
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()> {
        let desc = RTCSessionDescription::try_from(desc)?;
        self.rtc()?.set_remote_description(desc).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.rtc().ok()?.local_description().await?;
        desc.try_into().ok()
    }

    async fn has_remote_description(&self) -> bool {
        let Ok(rtc) = self.rtc() else {
            return false;
        };
        rtc.remote_description().await.is_some()
    }

    async fn is_signaling_stable(&self) -> bool {
        self.rtc()
            .map(|rtc| rtc.signaling_state() == RTCSignalingState::Stable)
            .unwrap_or(false)
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        self.rtc()?.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn send_signalling(&mut self, text: String) -> Result<()> {
        let data_channel = self.data_channel.lock().await;
        let Some(data_channel) = data_channel.as_ref() else {
            bail!("Signalling channel is not available");
        };
        if !data_channel.is_open() {
            bail!("Signalling channel {} is not open", data_channel.label());
        }
        data_channel.send(text).await
    }

    async fn add_track(&mut self, track: &LocalTrack) -> Result<()> {
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_of(track.kind()),
            track.id().clone(),
            track.stream_id().clone(),
        ));
        let sender = self
            .rtc()?
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .with_context(|| format!("Failed to add {} track", track.kind()))?;
        self.senders.insert(track.id().clone(), sender);
        if self.placeholder_samples {
            let feed = spawn_placeholder_feed(local, track.kind());
            self.feeds.insert(track.id().clone(), feed);
        }
        Ok(())
    }

    async fn remove_track(&mut self, track_id: &str) -> Result<()> {
        if let Some(feed) = self.feeds.remove(track_id) {
            feed.abort();
        }
        let sender = self
            .senders
            .remove(track_id)
            .ok_or_else(|| anyhow!("Unknown track {}", track_id))?;
        self.rtc()?.remove_track(&sender).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(data_channel) = self.data_channel.lock().await.take() {
            let _ = data_channel.close().await;
        }
        self.senders.clear();
        for (_, feed) in self.feeds.drain() {
            feed.abort();
        }
        let Some(rtc) = self.rtc.take() else {
            return Ok(());
        };
        rtc.close().await?;
        Ok(())
    }
}
