use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    connection::signaling::{
        socket::RelaySocket, IceCandidate, SdpType, SessionDescription, SignalingMessage,
        StreamIds,
    },
    media::{
        CallObserver, CapturedTrack, CloseReason, LocalTrack, MediaDevices, RemoteTrack,
        StreamKind, TrackKind,
    },
    signaling_server::ClientEvent,
};

use super::{AgentEvent, AgentEventSender, PeerTransport, Phase};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Peer connection double following the offer/answer state rules.
///
/// When linked, it plays the network too: the signalling channel opens once
/// a description exchange completes and channel text is delivered to the
/// other side's queue.
pub struct MockPeer {
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub sent: Vec<SignalingMessage>,
    pub tracks: Vec<LocalTrack>,
    pub channel_created: bool,
    pub closed: bool,
    pub offers_created: usize,
    state: SignalingState,
    answers_created: usize,
    gathered: bool,
    opened: bool,
    own_tx: Option<AgentEventSender>,
    other_tx: Option<AgentEventSender>,
}

impl Default for MockPeer {
    fn default() -> Self {
        Self {
            local: None,
            remote: None,
            candidates: vec![],
            sent: vec![],
            tracks: vec![],
            channel_created: false,
            closed: false,
            offers_created: 0,
            state: SignalingState::Stable,
            answers_created: 0,
            gathered: false,
            opened: false,
            own_tx: None,
            other_tx: None,
        }
    }
}

impl MockPeer {
    pub fn linked(own_tx: AgentEventSender, other_tx: AgentEventSender) -> Self {
        Self {
            own_tx: Some(own_tx),
            other_tx: Some(other_tx),
            ..Default::default()
        }
    }

    fn notify(&self, event: AgentEvent) {
        if let Some(tx) = &self.own_tx {
            let _ = tx.send(event);
        }
    }

    fn open_if_negotiated(&mut self) {
        if self.opened || self.state != SignalingState::Stable || self.remote.is_none() {
            return;
        }
        self.opened = true;
        self.notify(AgentEvent::DataChannelOpen);
    }
}

#[async_trait]
impl PeerTransport for MockPeer {
    async fn create_signalling_channel(&mut self) -> Result<()> {
        self.channel_created = true;
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription> {
        self.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "offer-{}",
            self.offers_created
        )))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription> {
        if self.state != SignalingState::HaveRemoteOffer {
            bail!("no remote offer to answer");
        }
        self.answers_created += 1;
        Ok(SessionDescription::answer(format!(
            "answer-{}",
            self.answers_created
        )))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<()> {
        self.state = match (self.state, desc.sdp_type()) {
            (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveLocalOffer,
            (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
            (state, sdp_type) => bail!("cannot set local {:?} in {:?}", sdp_type, state),
        };
        self.local = Some(desc);
        if !self.gathered {
            self.gathered = true;
            self.notify(AgentEvent::LocalCandidate(Some(IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 192.0.2.1 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            })));
            self.notify(AgentEvent::LocalCandidate(None));
        }
        self.open_if_negotiated();
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()> {
        self.state = match (self.state, desc.sdp_type()) {
            (SignalingState::Stable, SdpType::Offer) => {
                if self.remote.is_none() {
                    self.notify(AgentEvent::IncomingDataChannel);
                }
                SignalingState::HaveRemoteOffer
            }
            (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
            (state, sdp_type) => bail!("cannot set remote {:?} in {:?}", sdp_type, state),
        };
        self.remote = Some(desc);
        self.open_if_negotiated();
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.clone()
    }

    async fn has_remote_description(&self) -> bool {
        self.remote.is_some()
    }

    async fn is_signaling_stable(&self) -> bool {
        self.state == SignalingState::Stable
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.remote.is_none() {
            bail!("remote description is not set");
        }
        self.candidates.push(candidate);
        Ok(())
    }

    async fn send_signalling(&mut self, text: String) -> Result<()> {
        if self.closed {
            bail!("channel closed");
        }
        self.sent.push(SignalingMessage::parse(&text)?);
        if let Some(tx) = &self.other_tx {
            let _ = tx.send(AgentEvent::ChannelMessage(text));
        }
        Ok(())
    }

    async fn add_track(&mut self, track: &LocalTrack) -> Result<()> {
        self.tracks.push(track.clone());
        Ok(())
    }

    async fn remove_track(&mut self, track_id: &str) -> Result<()> {
        let before = self.tracks.len();
        self.tracks.retain(|x| x.id() != track_id);
        if self.tracks.len() == before {
            bail!("unknown track {}", track_id);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct MockDevices {
    decline_display: bool,
}

impl MockDevices {
    pub fn declining_display() -> Self {
        Self {
            decline_display: true,
        }
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn request_user_media(&mut self, audio: bool, video: bool) -> Result<Vec<CapturedTrack>> {
        let mut tracks = vec![];
        if audio {
            tracks.push(CapturedTrack::new(TrackKind::Audio, "mic".into()));
        }
        if video {
            tracks.push(CapturedTrack::new(TrackKind::Video, "camera".into()));
        }
        Ok(tracks)
    }

    async fn request_display_media(&mut self) -> Result<Vec<CapturedTrack>> {
        if self.decline_display {
            bail!("permission denied");
        }
        Ok(vec![CapturedTrack::new(TrackKind::Video, "screen".into())])
    }
}

#[derive(Clone, Default)]
pub struct RecordingSocket {
    events: Arc<Mutex<Vec<ClientEvent>>>,
    disconnected: Arc<AtomicBool>,
    fail_disconnect: bool,
}

impl RecordingSocket {
    /// Disconnects, but reports an error doing so.
    pub fn failing_disconnect() -> Self {
        Self {
            fail_disconnect: true,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelaySocket for RecordingSocket {
    async fn emit(&mut self, event: ClientEvent) -> Result<()> {
        if self.is_disconnected() {
            bail!("disconnected");
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        if self.fail_disconnect {
            bail!("close frame not acknowledged");
        }
        Ok(())
    }
}

#[derive(Default)]
struct Observed {
    remote_ids: Option<StreamIds>,
    tracks: Vec<(bool, StreamKind, String)>,
    camera: Option<bool>,
    muted: Option<bool>,
    sharing: Option<bool>,
    closed: Option<CloseReason>,
    phases: Option<mpsc::UnboundedSender<Phase>>,
}

#[derive(Clone, Default)]
pub struct RecordingObserver(Arc<Mutex<Observed>>);

impl RecordingObserver {
    pub fn with_phases(tx: mpsc::UnboundedSender<Phase>) -> Self {
        Self(Arc::new(Mutex::new(Observed {
            phases: Some(tx),
            ..Default::default()
        })))
    }

    pub fn remote_ids(&self) -> Option<StreamIds> {
        self.0.lock().unwrap().remote_ids.clone()
    }

    pub fn tracks(&self) -> Vec<(bool, StreamKind, String)> {
        self.0.lock().unwrap().tracks.clone()
    }

    pub fn camera(&self) -> Option<bool> {
        self.0.lock().unwrap().camera
    }

    pub fn muted(&self) -> Option<bool> {
        self.0.lock().unwrap().muted
    }

    pub fn sharing(&self) -> Option<bool> {
        self.0.lock().unwrap().sharing
    }

    pub fn closed(&self) -> Option<CloseReason> {
        self.0.lock().unwrap().closed
    }
}

impl CallObserver for RecordingObserver {
    fn on_phase_changed(&mut self, phase: Phase) {
        if let Some(tx) = &self.0.lock().unwrap().phases {
            let _ = tx.send(phase);
        }
    }

    fn on_remote_stream_ids(&mut self, ids: &StreamIds) {
        self.0.lock().unwrap().remote_ids = Some(ids.clone());
    }

    fn on_remote_track_added(&mut self, stream: StreamKind, track: &RemoteTrack) {
        self.0
            .lock()
            .unwrap()
            .tracks
            .push((true, stream, track.track_id().clone()));
    }

    fn on_remote_track_removed(&mut self, stream: StreamKind, track: &RemoteTrack) {
        self.0
            .lock()
            .unwrap()
            .tracks
            .push((false, stream, track.track_id().clone()));
    }

    fn on_camera_changed(&mut self, on: bool) {
        self.0.lock().unwrap().camera = Some(on);
    }

    fn on_muted_changed(&mut self, muted: bool) {
        self.0.lock().unwrap().muted = Some(muted);
    }

    fn on_screen_share_changed(&mut self, sharing: bool) {
        self.0.lock().unwrap().sharing = Some(sharing);
    }

    fn on_closed(&mut self, reason: CloseReason) {
        self.0.lock().unwrap().closed = Some(reason);
    }
}

pub struct PhaseRecorder(mpsc::UnboundedSender<Phase>);

impl PhaseRecorder {
    pub fn new(tx: mpsc::UnboundedSender<Phase>) -> Self {
        Self(tx)
    }
}

impl CallObserver for PhaseRecorder {
    fn on_phase_changed(&mut self, phase: Phase) {
        let _ = self.0.send(phase);
    }
}
