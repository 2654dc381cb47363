use anyhow::{Context, Result};
use getset::{CopyGetters, Getters};
use tracing::{debug, info, trace, warn};

use crate::{
    connection::signaling::{
        socket::RelaySocket, IceCandidate, SessionDescription, SignalingMessage, StreamIds,
    },
    media::{
        CallObserver, CloseReason, LocalStream, MediaDevices, RemoteTrack, StreamKind, TrackKind,
    },
    signaling_server::{ClientEvent, ServerEvent},
    CallId,
};

use super::{
    AgentEvent, AgentEventReceiver, ConnectionState, LocalCommand, PeerTransport, Phase, Role,
    RoleStrategy,
};

/// Per-call negotiation state machine.
///
/// Bootstraps through the relay, hands signalling off to the direct data
/// channel as soon as it opens, then serves renegotiation and teardown over
/// that channel. Every input arrives through [`Self::handle`].
#[derive(Getters, CopyGetters)]
pub struct NegotiationSession<P: PeerTransport> {
    #[getset(get = "pub")]
    call_id: CallId,
    #[getset(get = "pub")]
    peer: P,
    #[getset(get_copy = "pub")]
    role: Option<Role>,
    #[getset(get_copy = "pub")]
    phase: Phase,
    relay: Option<Box<dyn RelaySocket>>,
    strategy: RoleStrategy,
    #[getset(get_copy = "pub")]
    channel_open: bool,
    #[getset(get = "pub")]
    local_user_stream: LocalStream,
    #[getset(get = "pub")]
    local_display_stream: LocalStream,
    #[getset(get = "pub")]
    remote_stream_ids: Option<StreamIds>,
    #[getset(get_copy = "pub")]
    sharing: bool,
    hangup_requested: bool,
    devices: Box<dyn MediaDevices>,
    observer: Box<dyn CallObserver>,
}

impl<P: PeerTransport> NegotiationSession<P> {
    pub fn new(
        call_id: CallId,
        peer: P,
        relay: Box<dyn RelaySocket>,
        strategy: RoleStrategy,
        devices: Box<dyn MediaDevices>,
        observer: Box<dyn CallObserver>,
    ) -> Self {
        Self {
            call_id,
            peer,
            role: None,
            phase: Phase::Idle,
            relay: Some(relay),
            strategy,
            channel_open: false,
            local_user_stream: LocalStream::new(),
            local_display_stream: LocalStream::new(),
            remote_stream_ids: None,
            sharing: false,
            hangup_requested: false,
            devices,
            observer,
        }
    }

    pub fn is_relay_connected(&self) -> bool {
        self.relay.is_some()
    }

    /// Drains the queue until the session closes or every sender is gone.
    pub async fn run(mut self, mut events: AgentEventReceiver) -> Self {
        while self.phase != Phase::Closed {
            let Some(event) = events.recv().await else {
                debug!("event queue closed");
                break;
            };
            self.handle(event).await;
        }
        self
    }

    /// Errors are logged and the message is dropped; the machine does not
    /// advance for it.
    pub async fn handle(&mut self, event: AgentEvent) {
        if self.phase == Phase::Closed {
            trace!("ignored after close: {:?}", event);
            return;
        }
        if let Err(err) = self.dispatch(event).await {
            warn!("{:#}", err);
        }
    }

    async fn dispatch(&mut self, event: AgentEvent) -> Result<()> {
        match event {
            AgentEvent::RelayConnected => self.on_relay_connected().await,
            AgentEvent::RelayClosed => {
                if self.relay.take().is_some() {
                    warn!("relay connection lost in {:?}", self.phase);
                }
                Ok(())
            }
            AgentEvent::Relay(event) => self.on_relay_event(event).await,
            AgentEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate).await,
            AgentEvent::IncomingDataChannel => {
                debug!("signalling channel received");
                Ok(())
            }
            AgentEvent::DataChannelOpen => self.on_data_channel_open().await,
            AgentEvent::DataChannelClosed => {
                debug!("signalling channel closed");
                self.channel_open = false;
                Ok(())
            }
            AgentEvent::ChannelMessage(text) => self.on_channel_message(&text).await,
            AgentEvent::NegotiationNeeded => self.renegotiate().await,
            AgentEvent::ConnectionStateChanged(state) => {
                self.on_connection_state_changed(state).await;
                Ok(())
            }
            AgentEvent::RemoteTrackAdded(track) => {
                let stream = self.classify(&track);
                info!("remote {} {} track added", stream, track.kind());
                self.observer.on_remote_track_added(stream, &track);
                Ok(())
            }
            AgentEvent::RemoteTrackRemoved(track) => {
                let stream = self.classify(&track);
                info!("remote {} {} track removed", stream, track.kind());
                self.observer.on_remote_track_removed(stream, &track);
                Ok(())
            }
            AgentEvent::Local(command) => self.on_local_command(command).await,
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        debug!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        self.observer.on_phase_changed(phase);
    }

    async fn emit(&mut self, event: ClientEvent) -> Result<()> {
        let Some(relay) = self.relay.as_mut() else {
            debug!("relay already dropped, not sending {:?}", event);
            return Ok(());
        };
        relay.emit(event).await
    }

    async fn send(&mut self, msg: &SignalingMessage) -> Result<()> {
        self.peer
            .send_signalling(msg.to_text()?)
            .await
            .context("Failed to send on signalling channel")
    }

    async fn local_description(&mut self) -> Result<SessionDescription> {
        self.peer
            .local_description()
            .await
            .context("Local description is missing")
    }

    // Bootstrap

    async fn on_relay_connected(&mut self) -> Result<()> {
        if self.phase != Phase::Idle {
            return Ok(());
        }
        let event = match self.strategy {
            RoleStrategy::Check => ClientEvent::check_for_call(&self.call_id),
            RoleStrategy::Claim => ClientEvent::claim_role(&self.call_id),
        };
        self.emit(event).await
    }

    async fn on_relay_event(&mut self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::CheckResult(exists) => {
                let role = if exists { Role::Callee } else { Role::Caller };
                self.determine_role(role).await
            }
            ServerEvent::RoleAssigned(role) => self.determine_role(role).await,
            ServerEvent::ReceiveRemoteDescriptionOffer(offer) => self.on_relay_offer(offer).await,
            ServerEvent::ReceiveRemoteDescriptionAnswer(answer) => {
                self.on_relay_answer(answer).await
            }
            ServerEvent::ReceiveCandidate(candidate) => {
                self.apply_candidate(candidate).await;
                Ok(())
            }
        }
    }

    async fn determine_role(&mut self, role: Role) -> Result<()> {
        if self.phase != Phase::Idle {
            debug!("role already determined, ignored {}", role);
            return Ok(());
        }
        info!("[Call] {} as {}", self.call_id, role);
        self.role = Some(role);
        self.set_phase(Phase::RoleDetermined);
        match role {
            Role::Caller => self.create_call().await,
            Role::Callee => self.answer_call().await,
        }
    }

    async fn create_call(&mut self) -> Result<()> {
        self.peer.create_signalling_channel().await?;
        self.acquire_user_media(true, false).await;
        self.emit(ClientEvent::join(&self.call_id)).await?;

        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer).await?;
        self.set_phase(Phase::LocalDescriptionSet);

        let offer = self.local_description().await?;
        self.emit(ClientEvent::offer(&self.call_id, offer)).await?;
        self.set_phase(Phase::CallerWaitingAnswer);
        Ok(())
    }

    async fn answer_call(&mut self) -> Result<()> {
        self.acquire_user_media(true, false).await;
        self.emit(ClientEvent::answer_call(&self.call_id)).await?;
        self.set_phase(Phase::CalleeAwaitingOffer);
        Ok(())
    }

    async fn on_relay_offer(&mut self, offer: SessionDescription) -> Result<()> {
        if self.role != Some(Role::Callee) || self.phase != Phase::CalleeAwaitingOffer {
            debug!("ignored relay offer in {:?}", self.phase);
            return Ok(());
        }
        self.peer
            .set_remote_description(offer)
            .await
            .context("Failed to apply relay offer")?;
        self.set_phase(Phase::RemoteDescriptionSet);

        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer).await?;
        let answer = self.local_description().await?;
        self.emit(ClientEvent::answer(&self.call_id, answer)).await
    }

    async fn on_relay_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.role != Some(Role::Caller) {
            debug!("ignored relay answer as {:?}", self.role);
            return Ok(());
        }
        if self.peer.has_remote_description().await || self.peer.is_signaling_stable().await {
            debug!("ignored late relay answer");
            return Ok(());
        }
        self.peer
            .set_remote_description(answer)
            .await
            .context("Failed to apply relay answer")?;
        if self.phase == Phase::CallerWaitingAnswer {
            self.set_phase(Phase::RemoteDescriptionSet);
        }
        Ok(())
    }

    async fn on_local_candidate(&mut self, candidate: Option<IceCandidate>) -> Result<()> {
        if self.relay.is_none() {
            let Some(candidate) = candidate else {
                return Ok(());
            };
            if !self.channel_open {
                debug!("dropped local candidate, no signalling path");
                return Ok(());
            }
            return self.send(&SignalingMessage::Candidate { candidate }).await;
        }
        if let Some(candidate) = candidate {
            self.emit(ClientEvent::candidate(&self.call_id, candidate))
                .await?;
        }
        if self.role == Some(Role::Caller)
            && matches!(
                self.phase,
                Phase::LocalDescriptionSet | Phase::CallerWaitingAnswer
            )
        {
            // Late answerers read the stored offer, which should carry every
            // candidate gathered so far.
            let offer = self.local_description().await?;
            self.emit(ClientEvent::offer(&self.call_id, offer)).await?;
        }
        Ok(())
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        if let Err(err) = self.peer.add_ice_candidate(candidate).await {
            debug!("candidate not applied: {:#}", err);
        }
    }

    // Handoff and steady state

    async fn on_data_channel_open(&mut self) -> Result<()> {
        if self.channel_open {
            return Ok(());
        }
        self.channel_open = true;
        self.set_phase(Phase::DataChannelOpen);
        info!("[Call] Direct channel open: {}", self.call_id);

        if let Some(mut relay) = self.relay.take() {
            if let Err(err) = relay.emit(ClientEvent::remove_call(&self.call_id)).await {
                warn!("failed to remove call from relay: {:#}", err);
            }
            if let Err(err) = relay.disconnect().await {
                warn!("failed to disconnect relay: {:#}", err);
            }
        }

        let ids = StreamIds::new(
            self.local_user_stream.id().clone(),
            self.local_display_stream.id().clone(),
        );
        self.send(&SignalingMessage::StreamIds(ids)).await?;
        if self.remote_stream_ids.is_some() {
            self.set_phase(Phase::SteadyState);
        }
        Ok(())
    }

    async fn on_channel_message(&mut self, text: &str) -> Result<()> {
        let msg = SignalingMessage::parse(text)
            .with_context(|| format!("Invalid signalling message: {}", text))?;
        trace!("channel -> {:?}", msg);
        match msg {
            SignalingMessage::Action { .. } => {
                info!("[Call] Remote hangup: {}", self.call_id);
                self.teardown(CloseReason::RemoteHangup).await;
                Ok(())
            }
            SignalingMessage::StreamIds(ids) => {
                self.observer.on_remote_stream_ids(&ids);
                self.remote_stream_ids = Some(ids);
                if self.channel_open {
                    self.set_phase(Phase::SteadyState);
                }
                Ok(())
            }
            SignalingMessage::Candidate { candidate } => {
                self.apply_candidate(candidate).await;
                Ok(())
            }
            SignalingMessage::Sdp { sdp } if sdp.is_offer() => {
                self.peer
                    .set_remote_description(sdp)
                    .await
                    .context("Failed to apply channel offer")?;
                let answer = self.peer.create_answer().await?;
                self.peer.set_local_description(answer).await?;
                let sdp = self.local_description().await?;
                self.send(&SignalingMessage::Sdp { sdp }).await
            }
            SignalingMessage::Sdp { sdp } => self
                .peer
                .set_remote_description(sdp)
                .await
                .context("Failed to apply channel answer"),
        }
    }

    async fn renegotiate(&mut self) -> Result<()> {
        if !self.channel_open {
            debug!("negotiationneeded dropped, channel not open");
            return Ok(());
        }
        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer).await?;
        let sdp = self.local_description().await?;
        self.send(&SignalingMessage::Sdp { sdp }).await
    }

    fn classify(&self, track: &RemoteTrack) -> StreamKind {
        match &self.remote_stream_ids {
            Some(ids) if ids.display_stream_id() == track.stream_id() => StreamKind::Display,
            _ => StreamKind::User,
        }
    }

    // Teardown

    async fn on_connection_state_changed(&mut self, state: ConnectionState) {
        debug!("connection state: {:?}", state);
        if !matches!(state, ConnectionState::Disconnected | ConnectionState::Failed) {
            return;
        }
        if self.hangup_requested {
            return;
        }
        info!("[Call] Connection lost: {}", self.call_id);
        self.teardown(CloseReason::ConnectionLost).await;
    }

    async fn teardown(&mut self, reason: CloseReason) {
        if self.phase == Phase::Closed {
            return;
        }
        if let Some(mut relay) = self.relay.take() {
            if self.role.is_some() {
                if let Err(err) = relay.emit(ClientEvent::remove_call(&self.call_id)).await {
                    debug!("failed to remove call from relay: {:#}", err);
                }
            }
            if let Err(err) = relay.disconnect().await {
                debug!("failed to disconnect relay: {:#}", err);
            }
        }
        for track in self
            .local_user_stream
            .take_all()
            .into_iter()
            .chain(self.local_display_stream.take_all())
        {
            self.devices.stop(&track);
        }
        if let Err(err) = self.peer.close().await {
            warn!("failed to close peer connection: {:#}", err);
        }
        self.channel_open = false;
        self.set_phase(Phase::Closed);
        self.observer.on_closed(reason);
    }

    // Local controls

    async fn on_local_command(&mut self, command: LocalCommand) -> Result<()> {
        match command {
            LocalCommand::SetCamera(on) => self.set_camera(on).await,
            LocalCommand::SetMuted(muted) => {
                let changed = self.local_user_stream.set_enabled(TrackKind::Audio, !muted);
                debug!("muted={} ({} tracks)", muted, changed);
                self.observer.on_muted_changed(muted);
                Ok(())
            }
            LocalCommand::SetScreenShare(on) => self.set_screen_share(on).await,
            LocalCommand::Hangup => {
                self.hangup_requested = true;
                if self.channel_open {
                    if let Err(err) = self.send(&SignalingMessage::disconnect()).await {
                        warn!("{:#}", err);
                    }
                }
                info!("[Call] Hangup: {}", self.call_id);
                self.teardown(CloseReason::LocalHangup).await;
                Ok(())
            }
        }
    }

    async fn acquire_user_media(&mut self, audio: bool, video: bool) {
        let captured = match self.devices.request_user_media(audio, video).await {
            Ok(captured) => captured,
            Err(err) => {
                warn!("user media unavailable: {:#}", err);
                return;
            }
        };
        for captured in captured {
            let track = self.local_user_stream.add(captured);
            if let Err(err) = self.peer.add_track(&track).await {
                warn!("failed to add {} track: {:#}", track.kind(), err);
            }
        }
    }

    async fn set_camera(&mut self, on: bool) -> Result<()> {
        let has_video = self.local_user_stream.has_kind(TrackKind::Video);
        if on == has_video {
            return Ok(());
        }
        if on {
            let captured = self
                .devices
                .request_user_media(false, true)
                .await
                .context("Camera unavailable")?;
            for captured in captured {
                let track = self.local_user_stream.add(captured);
                self.peer.add_track(&track).await?;
            }
        } else {
            for track in self.local_user_stream.take_kind(TrackKind::Video) {
                self.devices.stop(&track);
                self.peer.remove_track(track.id()).await?;
            }
        }
        self.observer.on_camera_changed(on);
        Ok(())
    }

    async fn remove_display_tracks(&mut self) {
        for track in self.local_display_stream.take_all() {
            self.devices.stop(&track);
            if let Err(err) = self.peer.remove_track(track.id()).await {
                debug!("failed to remove display track: {:#}", err);
            }
        }
    }

    async fn set_screen_share(&mut self, on: bool) -> Result<()> {
        self.sharing = on;
        if let Err(err) = self.update_display_stream(on).await {
            warn!("screen share failed: {:#}", err);
            self.sharing = false;
            self.remove_display_tracks().await;
            self.observer.on_screen_share_changed(false);
            return Ok(());
        }
        self.observer.on_screen_share_changed(on);
        Ok(())
    }

    async fn update_display_stream(&mut self, on: bool) -> Result<()> {
        self.remove_display_tracks().await;
        if !on {
            return Ok(());
        }
        let captured = self
            .devices
            .request_display_media()
            .await
            .context("Display capture declined")?;
        for captured in captured {
            let track = self.local_display_stream.add(captured);
            self.peer.add_track(&track).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::{
        spawn,
        sync::mpsc,
        time::{timeout, Duration},
    };

    use crate::{
        call_id::resolve_call_id,
        connection::signaling::socket::ChannelSocket,
        negotiation::mock::{
            MockDevices, MockPeer, PhaseRecorder, RecordingObserver, RecordingSocket,
        },
        signaling_server::relay::Relay,
    };

    use super::*;

    type Session = NegotiationSession<MockPeer>;

    fn session(strategy: RoleStrategy) -> (Session, RecordingSocket, RecordingObserver) {
        let socket = RecordingSocket::default();
        let observer = RecordingObserver::default();
        let session = NegotiationSession::new(
            CallId::generate(),
            MockPeer::default(),
            Box::new(socket.clone()),
            strategy,
            Box::new(MockDevices::default()),
            Box::new(observer.clone()),
        );
        (session, socket, observer)
    }

    fn channel_text(msg: SignalingMessage) -> AgentEvent {
        AgentEvent::ChannelMessage(msg.to_text().unwrap())
    }

    fn remote_ids() -> StreamIds {
        StreamIds::new("remote-user".into(), "remote-display".into())
    }

    async fn steady_caller() -> (Session, RecordingSocket, RecordingObserver) {
        let (mut s, socket, observer) = session(RoleStrategy::Check);
        s.handle(AgentEvent::RelayConnected).await;
        s.handle(AgentEvent::Relay(ServerEvent::CheckResult(false)))
            .await;
        s.handle(AgentEvent::Relay(
            ServerEvent::ReceiveRemoteDescriptionAnswer(SessionDescription::answer("a1")),
        ))
        .await;
        s.handle(AgentEvent::DataChannelOpen).await;
        s.handle(channel_text(SignalingMessage::StreamIds(remote_ids())))
            .await;
        assert_eq!(s.phase(), Phase::SteadyState);
        (s, socket, observer)
    }

    #[tokio::test]
    async fn caller_bootstrap_goes_through_relay() {
        let (mut s, socket, _) = session(RoleStrategy::Check);
        let call_id = s.call_id().clone();

        s.handle(AgentEvent::RelayConnected).await;
        assert_eq!(socket.events(), vec![ClientEvent::check_for_call(&call_id)]);

        s.handle(AgentEvent::Relay(ServerEvent::CheckResult(false)))
            .await;
        assert_eq!(s.role(), Some(Role::Caller));
        assert_eq!(s.phase(), Phase::CallerWaitingAnswer);
        assert!(s.peer().channel_created);
        assert_eq!(s.local_user_stream().tracks().len(), 1);

        let offer = s.peer().local.clone().unwrap();
        assert!(offer.is_offer());
        assert_eq!(
            socket.events()[1..],
            [
                ClientEvent::join(&call_id),
                ClientEvent::offer(&call_id, offer.clone()),
            ]
        );

        s.handle(AgentEvent::LocalCandidate(Some(IceCandidate::default())))
            .await;
        assert_eq!(
            socket.events()[3..],
            [
                ClientEvent::candidate(&call_id, IceCandidate::default()),
                ClientEvent::offer(&call_id, offer),
            ]
        );

        s.handle(AgentEvent::Relay(
            ServerEvent::ReceiveRemoteDescriptionAnswer(SessionDescription::answer("a1")),
        ))
        .await;
        assert_eq!(s.phase(), Phase::RemoteDescriptionSet);
        s.handle(AgentEvent::Relay(
            ServerEvent::ReceiveRemoteDescriptionAnswer(SessionDescription::answer("a2")),
        ))
        .await;
        assert_eq!(s.peer().remote, Some(SessionDescription::answer("a1")));
    }

    #[tokio::test]
    async fn callee_answers_once() {
        let (mut s, socket, _) = session(RoleStrategy::Check);
        let call_id = s.call_id().clone();

        s.handle(AgentEvent::RelayConnected).await;
        s.handle(AgentEvent::Relay(ServerEvent::CheckResult(true)))
            .await;
        assert_eq!(s.role(), Some(Role::Callee));
        assert_eq!(s.phase(), Phase::CalleeAwaitingOffer);
        assert!(!s.peer().channel_created);

        // Too early: no remote description yet. Logged, not fatal.
        s.handle(AgentEvent::Relay(ServerEvent::ReceiveCandidate(
            IceCandidate::default(),
        )))
        .await;
        assert!(s.peer().candidates.is_empty());

        s.handle(AgentEvent::Relay(
            ServerEvent::ReceiveRemoteDescriptionOffer(SessionDescription::offer("o1")),
        ))
        .await;
        s.handle(AgentEvent::Relay(
            ServerEvent::ReceiveRemoteDescriptionOffer(SessionDescription::offer("o2")),
        ))
        .await;
        assert_eq!(s.phase(), Phase::RemoteDescriptionSet);
        assert_eq!(s.peer().remote, Some(SessionDescription::offer("o1")));

        let answer = s.peer().local.clone().unwrap();
        let answers: Vec<_> = socket
            .events()
            .into_iter()
            .filter(|x| matches!(x, ClientEvent::SendLocalDescriptionAnswer { .. }))
            .collect();
        assert_eq!(answers, vec![ClientEvent::answer(&call_id, answer)]);
        assert_eq!(socket.events()[1], ClientEvent::answer_call(&call_id));

        s.handle(AgentEvent::Relay(ServerEvent::ReceiveCandidate(
            IceCandidate::default(),
        )))
        .await;
        assert_eq!(s.peer().candidates.len(), 1);
    }

    #[tokio::test]
    async fn claim_strategy_uses_assigned_role() {
        let (mut s, socket, _) = session(RoleStrategy::Claim);
        let call_id = s.call_id().clone();

        s.handle(AgentEvent::RelayConnected).await;
        assert_eq!(socket.events(), vec![ClientEvent::claim_role(&call_id)]);

        s.handle(AgentEvent::Relay(ServerEvent::RoleAssigned(Role::Callee)))
            .await;
        s.handle(AgentEvent::Relay(ServerEvent::RoleAssigned(Role::Caller)))
            .await;
        assert_eq!(s.role(), Some(Role::Callee));
    }

    #[tokio::test]
    async fn handoff_leaves_the_relay() {
        let (mut s, socket, observer) = steady_caller().await;
        let call_id = s.call_id().clone();

        assert!(!s.is_relay_connected());
        assert!(socket.is_disconnected());
        assert_eq!(
            socket.events().last(),
            Some(&ClientEvent::remove_call(&call_id))
        );
        assert_eq!(
            s.peer().sent[0],
            SignalingMessage::StreamIds(StreamIds::new(
                s.local_user_stream().id().clone(),
                s.local_display_stream().id().clone(),
            ))
        );
        assert_eq!(observer.remote_ids(), Some(remote_ids()));

        // Candidates now travel over the channel.
        let before = socket.events().len();
        s.handle(AgentEvent::LocalCandidate(Some(IceCandidate::default())))
            .await;
        assert_eq!(socket.events().len(), before);
        assert_eq!(
            s.peer().sent.last(),
            Some(&SignalingMessage::Candidate {
                candidate: IceCandidate::default()
            })
        );
    }

    #[tokio::test]
    async fn relay_disconnect_failure_does_not_block_handshake() {
        let socket = RecordingSocket::failing_disconnect();
        let mut s = NegotiationSession::new(
            CallId::generate(),
            MockPeer::default(),
            Box::new(socket.clone()),
            RoleStrategy::Check,
            Box::new(MockDevices::default()),
            Box::new(RecordingObserver::default()),
        );
        s.handle(AgentEvent::RelayConnected).await;
        s.handle(AgentEvent::Relay(ServerEvent::CheckResult(false)))
            .await;
        s.handle(AgentEvent::Relay(
            ServerEvent::ReceiveRemoteDescriptionAnswer(SessionDescription::answer("a1")),
        ))
        .await;

        s.handle(AgentEvent::DataChannelOpen).await;

        assert!(!s.is_relay_connected());
        assert!(socket.is_disconnected());
        assert!(matches!(
            s.peer().sent.first(),
            Some(SignalingMessage::StreamIds(_))
        ));
        s.handle(channel_text(SignalingMessage::StreamIds(remote_ids())))
            .await;
        assert_eq!(s.phase(), Phase::SteadyState);
    }

    #[tokio::test]
    async fn stream_ids_before_open_still_reach_steady_state() {
        let (mut s, _, _) = session(RoleStrategy::Check);
        s.handle(AgentEvent::RelayConnected).await;
        s.handle(AgentEvent::Relay(ServerEvent::CheckResult(true)))
            .await;
        s.handle(channel_text(SignalingMessage::StreamIds(remote_ids())))
            .await;
        assert_eq!(s.phase(), Phase::CalleeAwaitingOffer);
        s.handle(AgentEvent::DataChannelOpen).await;
        assert_eq!(s.phase(), Phase::SteadyState);
    }

    #[tokio::test]
    async fn negotiation_needed_is_dropped_before_handoff() {
        let (mut s, socket, _) = session(RoleStrategy::Check);
        s.handle(AgentEvent::RelayConnected).await;
        s.handle(AgentEvent::Relay(ServerEvent::CheckResult(false)))
            .await;
        let before = socket.events().len();

        s.handle(AgentEvent::NegotiationNeeded).await;

        assert_eq!(socket.events().len(), before);
        assert!(s.peer().sent.is_empty());
        assert_eq!(s.peer().offers_created, 1);
    }

    #[tokio::test]
    async fn local_change_renegotiates_once_over_channel() {
        let (mut s, socket, observer) = steady_caller().await;
        let relay_events = socket.events().len();
        let sent = s.peer().sent.len();

        s.handle(AgentEvent::Local(LocalCommand::SetCamera(true)))
            .await;
        assert!(s.local_user_stream().has_kind(TrackKind::Video));
        assert_eq!(observer.camera(), Some(true));
        s.handle(AgentEvent::NegotiationNeeded).await;

        let offers: Vec<_> = s.peer().sent[sent..]
            .iter()
            .filter(|x| matches!(x, SignalingMessage::Sdp { sdp } if sdp.is_offer()))
            .cloned()
            .collect();
        assert_eq!(offers.len(), 1);

        s.handle(channel_text(SignalingMessage::Sdp {
            sdp: SessionDescription::answer("a2"),
        }))
        .await;
        assert_eq!(s.peer().remote, Some(SessionDescription::answer("a2")));
        assert_eq!(s.peer().sent.len(), sent + 1);
        assert_eq!(socket.events().len(), relay_events);
    }

    #[tokio::test]
    async fn inbound_offer_is_always_answered() {
        let (mut s, _, _) = steady_caller().await;
        let sent = s.peer().sent.len();

        s.handle(channel_text(SignalingMessage::Sdp {
            sdp: SessionDescription::offer("remote-renegotiation"),
        }))
        .await;

        assert_eq!(s.peer().sent.len(), sent + 1);
        let SignalingMessage::Sdp { sdp } = &s.peer().sent[sent] else {
            panic!("expected an answer, got {:?}", s.peer().sent[sent]);
        };
        assert!(!sdp.is_offer());
        assert_eq!(s.phase(), Phase::SteadyState);
    }

    #[tokio::test]
    async fn malformed_channel_message_does_not_advance() {
        let (mut s, _, _) = steady_caller().await;
        let sent = s.peer().sent.len();

        s.handle(AgentEvent::ChannelMessage("{not json".into()))
            .await;
        s.handle(AgentEvent::ChannelMessage(r#"{"action":"explode"}"#.into()))
            .await;

        assert_eq!(s.phase(), Phase::SteadyState);
        assert_eq!(s.peer().sent.len(), sent);
    }

    #[tokio::test]
    async fn remote_disconnect_tears_down_in_any_state() {
        let (mut s, socket, observer) = session(RoleStrategy::Check);
        s.handle(AgentEvent::RelayConnected).await;
        s.handle(AgentEvent::Relay(ServerEvent::CheckResult(false)))
            .await;
        s.handle(AgentEvent::ConnectionStateChanged(ConnectionState::Connected))
            .await;

        s.handle(channel_text(SignalingMessage::disconnect())).await;

        assert_eq!(s.phase(), Phase::Closed);
        assert!(s.peer().closed);
        assert!(socket.is_disconnected());
        assert_eq!(observer.closed(), Some(CloseReason::RemoteHangup));

        // Terminal.
        s.handle(AgentEvent::DataChannelOpen).await;
        assert_eq!(s.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn local_hangup_notifies_peer() {
        let (mut s, _, observer) = steady_caller().await;

        s.handle(AgentEvent::Local(LocalCommand::Hangup)).await;
        s.handle(AgentEvent::ConnectionStateChanged(
            ConnectionState::Disconnected,
        ))
        .await;

        assert_eq!(s.peer().sent.last(), Some(&SignalingMessage::disconnect()));
        assert_eq!(s.phase(), Phase::Closed);
        assert!(s.peer().closed);
        assert!(s.local_user_stream().tracks().is_empty());
        assert_eq!(observer.closed(), Some(CloseReason::LocalHangup));
    }

    #[tokio::test]
    async fn connection_loss_closes() {
        let (mut s, _, observer) = steady_caller().await;

        s.handle(AgentEvent::ConnectionStateChanged(ConnectionState::Failed))
            .await;

        assert_eq!(s.phase(), Phase::Closed);
        assert_eq!(observer.closed(), Some(CloseReason::ConnectionLost));
    }

    #[tokio::test]
    async fn mute_toggles_audio_without_renegotiation() {
        let (mut s, _, observer) = steady_caller().await;
        let sent = s.peer().sent.len();

        s.handle(AgentEvent::Local(LocalCommand::SetMuted(true))).await;

        assert!(s
            .local_user_stream()
            .tracks()
            .iter()
            .filter(|x| x.kind() == TrackKind::Audio)
            .all(|x| !x.enabled()));
        assert_eq!(observer.muted(), Some(true));
        assert_eq!(s.peer().sent.len(), sent);
    }

    #[tokio::test]
    async fn screen_share_keeps_stream_id_and_rolls_back() {
        let (mut s, _, observer) = steady_caller().await;
        let display_id = s.local_display_stream().id().clone();

        s.handle(AgentEvent::Local(LocalCommand::SetScreenShare(true)))
            .await;
        assert!(s.sharing());
        assert_eq!(s.local_display_stream().tracks().len(), 1);
        assert_eq!(
            s.local_display_stream().tracks()[0].stream_id(),
            &display_id
        );
        assert_eq!(observer.sharing(), Some(true));

        s.handle(AgentEvent::Local(LocalCommand::SetScreenShare(false)))
            .await;
        assert!(s.local_display_stream().tracks().is_empty());
        assert_eq!(s.local_display_stream().id(), &display_id);
        assert_eq!(observer.sharing(), Some(false));
    }

    #[tokio::test]
    async fn declined_screen_share_rolls_back() {
        let socket = RecordingSocket::default();
        let observer = RecordingObserver::default();
        let mut s = NegotiationSession::new(
            CallId::generate(),
            MockPeer::default(),
            Box::new(socket),
            RoleStrategy::Check,
            Box::new(MockDevices::declining_display()),
            Box::new(observer.clone()),
        );

        s.handle(AgentEvent::Local(LocalCommand::SetScreenShare(true)))
            .await;

        assert!(!s.sharing());
        assert!(s.local_display_stream().tracks().is_empty());
        assert!(s.peer().tracks.is_empty());
        assert_eq!(observer.sharing(), Some(false));
    }

    #[tokio::test]
    async fn remote_tracks_are_classified_by_stream_id() {
        let (mut s, _, observer) = steady_caller().await;

        s.handle(AgentEvent::RemoteTrackAdded(RemoteTrack::new(
            "remote-display".into(),
            "t1".into(),
            TrackKind::Video,
        )))
        .await;
        s.handle(AgentEvent::RemoteTrackAdded(RemoteTrack::new(
            "remote-user".into(),
            "t2".into(),
            TrackKind::Audio,
        )))
        .await;
        s.handle(AgentEvent::RemoteTrackRemoved(RemoteTrack::new(
            "remote-display".into(),
            "t1".into(),
            TrackKind::Video,
        )))
        .await;

        assert_eq!(
            observer.tracks(),
            vec![
                (true, StreamKind::Display, "t1".to_owned()),
                (true, StreamKind::User, "t2".to_owned()),
                (false, StreamKind::Display, "t1".to_owned()),
            ]
        );
    }

    async fn wait_for(phases: &mut mpsc::UnboundedReceiver<Phase>, expected: Phase) {
        timeout(Duration::from_secs(5), async {
            while let Some(phase) = phases.recv().await {
                if phase == expected {
                    return;
                }
            }
            panic!("phase stream ended before {:?}", expected);
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", expected));
    }

    #[tokio::test]
    async fn two_agents_negotiate_through_in_process_relay() {
        let relay = Arc::new(Relay::new());
        let (call_id, replaced) = resolve_call_id(None);
        assert!(replaced);

        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (a_phase_tx, mut a_phases) = mpsc::unbounded_channel();
        let (b_phase_tx, mut b_phases) = mpsc::unbounded_channel();

        let a_socket = ChannelSocket::connect(relay.clone(), a_tx.clone())
            .await
            .unwrap();
        let a = NegotiationSession::new(
            call_id.clone(),
            MockPeer::linked(a_tx.clone(), b_tx.clone()),
            Box::new(a_socket),
            RoleStrategy::Check,
            Box::new(MockDevices::default()),
            Box::new(PhaseRecorder::new(a_phase_tx)),
        );
        let a = spawn(a.run(a_rx));
        wait_for(&mut a_phases, Phase::CallerWaitingAnswer).await;
        assert!(relay.has_call(&call_id).await);

        let b_socket = ChannelSocket::connect(relay.clone(), b_tx.clone())
            .await
            .unwrap();
        let b = NegotiationSession::new(
            call_id.clone(),
            MockPeer::linked(b_tx.clone(), a_tx.clone()),
            Box::new(b_socket),
            RoleStrategy::Check,
            Box::new(MockDevices::default()),
            Box::new(PhaseRecorder::new(b_phase_tx)),
        );
        let b = spawn(b.run(b_rx));

        wait_for(&mut a_phases, Phase::SteadyState).await;
        wait_for(&mut b_phases, Phase::SteadyState).await;
        assert!(!relay.has_call(&call_id).await);
        assert_eq!(relay.room_size(&call_id).await, 0);

        a_tx.send(AgentEvent::Local(LocalCommand::Hangup)).unwrap();
        let a = a.await.unwrap();
        let b = b.await.unwrap();

        assert_eq!(a.role(), Some(Role::Caller));
        assert_eq!(b.role(), Some(Role::Callee));
        assert_eq!(a.phase(), Phase::Closed);
        assert_eq!(b.phase(), Phase::Closed);
        assert_eq!(
            a.remote_stream_ids().as_ref().map(|x| x.user_stream_id().clone()),
            Some(b.local_user_stream().id().clone())
        );
        assert_eq!(a.peer().local.as_ref().map(|x| x.is_offer()), Some(true));
        assert_eq!(b.peer().local.as_ref().map(|x| x.is_offer()), Some(false));
        assert_eq!(a.peer().remote, b.peer().local);
        assert!(!relay.has_call(&call_id).await);
    }

    #[tokio::test]
    async fn claimed_roles_negotiate_through_in_process_relay() {
        let relay = Arc::new(Relay::new());
        let call_id = CallId::generate();

        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (a_phase_tx, mut a_phases) = mpsc::unbounded_channel();
        let (b_phase_tx, mut b_phases) = mpsc::unbounded_channel();

        let mut sessions = vec![];
        for (tx, other, rx, phase_tx) in [
            (a_tx.clone(), b_tx.clone(), a_rx, a_phase_tx),
            (b_tx.clone(), a_tx.clone(), b_rx, b_phase_tx),
        ] {
            let socket = ChannelSocket::connect(relay.clone(), tx.clone())
                .await
                .unwrap();
            let session = NegotiationSession::new(
                call_id.clone(),
                MockPeer::linked(tx, other),
                Box::new(socket),
                RoleStrategy::Claim,
                Box::new(MockDevices::default()),
                Box::new(PhaseRecorder::new(phase_tx)),
            );
            sessions.push(spawn(session.run(rx)));
        }

        wait_for(&mut a_phases, Phase::SteadyState).await;
        wait_for(&mut b_phases, Phase::SteadyState).await;
        assert!(!relay.has_call(&call_id).await);

        b_tx.send(AgentEvent::Local(LocalCommand::Hangup)).unwrap();
        let mut roles = vec![];
        for session in sessions {
            let session = session.await.unwrap();
            assert_eq!(session.phase(), Phase::Closed);
            roles.push(session.role());
        }
        roles.sort_by_key(|x| x.map(|x| x == Role::Callee));
        assert_eq!(roles, vec![Some(Role::Caller), Some(Role::Callee)]);
    }
}
