#[cfg(test)]
pub(crate) mod mock;
mod session;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    connection::signaling::{IceCandidate, SessionDescription},
    media::{LocalTrack, RemoteTrack},
    signaling_server::ServerEvent,
};

pub use session::NegotiationSession;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creates the call and owns the signalling channel.
    Caller,
    /// Answers and receives the signalling channel by event.
    Callee,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Caller => "caller",
            Role::Callee => "callee",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RoleDetermined,
    LocalDescriptionSet,
    CallerWaitingAnswer,
    CalleeAwaitingOffer,
    RemoteDescriptionSet,
    DataChannelOpen,
    SteadyState,
    Closed,
}

/// How the agent learns its role from the relay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleStrategy {
    /// `check-for-call`; racy when both participants arrive at once.
    #[default]
    Check,
    /// `claim-role`; the relay decides atomically.
    Claim,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalCommand {
    SetCamera(bool),
    SetMuted(bool),
    SetScreenShare(bool),
    Hangup,
}

/// Everything a session reacts to, funnelled through one queue.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    RelayConnected,
    RelayClosed,
    Relay(ServerEvent),
    /// `None` marks the end of gathering.
    LocalCandidate(Option<IceCandidate>),
    IncomingDataChannel,
    DataChannelOpen,
    DataChannelClosed,
    ChannelMessage(String),
    NegotiationNeeded,
    ConnectionStateChanged(ConnectionState),
    RemoteTrackAdded(RemoteTrack),
    RemoteTrackRemoved(RemoteTrack),
    Local(LocalCommand),
}

pub type AgentEventSender = mpsc::UnboundedSender<AgentEvent>;
pub type AgentEventReceiver = mpsc::UnboundedReceiver<AgentEvent>;

/// The peer connection as seen by the negotiation state machine.
///
/// Implementations report asynchronous happenings (candidates, channel
/// state, tracks) as [`AgentEvent`]s instead of returning them.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_signalling_channel(&mut self) -> Result<()>;
    async fn create_offer(&mut self) -> Result<SessionDescription>;
    async fn create_answer(&mut self) -> Result<SessionDescription>;
    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn has_remote_description(&self) -> bool;
    async fn is_signaling_stable(&self) -> bool;
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()>;
    async fn send_signalling(&mut self, text: String) -> Result<()>;
    async fn add_track(&mut self, track: &LocalTrack) -> Result<()>;
    async fn remove_track(&mut self, track_id: &str) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}
