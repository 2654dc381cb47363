pub mod relay;

use serde::{Deserialize, Serialize};

use crate::{
    connection::signaling::{IceCandidate, SessionDescription},
    negotiation::Role,
    CallId,
};

/// Frames sent by a participant to the relay. Call ids stay raw strings on
/// the wire; the relay validates them before touching any state.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    Join { call_id: String },
    #[serde(rename_all = "camelCase")]
    CheckForCall { call_id: String },
    #[serde(rename_all = "camelCase")]
    SendLocalDescriptionOffer {
        sdp: SessionDescription,
        call_id: String,
    },
    #[serde(rename_all = "camelCase")]
    AnswerCall { call_id: String },
    #[serde(rename_all = "camelCase")]
    SendLocalDescriptionAnswer {
        sdp: SessionDescription,
        call_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SendCandidate {
        candidate: IceCandidate,
        call_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RemoveCall { call_id: String },
    #[serde(rename_all = "camelCase")]
    ClaimRole { call_id: String },
}

impl ClientEvent {
    pub fn join(call_id: &CallId) -> Self {
        Self::Join {
            call_id: call_id.to_string(),
        }
    }

    pub fn check_for_call(call_id: &CallId) -> Self {
        Self::CheckForCall {
            call_id: call_id.to_string(),
        }
    }

    pub fn offer(call_id: &CallId, sdp: SessionDescription) -> Self {
        Self::SendLocalDescriptionOffer {
            sdp,
            call_id: call_id.to_string(),
        }
    }

    pub fn answer_call(call_id: &CallId) -> Self {
        Self::AnswerCall {
            call_id: call_id.to_string(),
        }
    }

    pub fn answer(call_id: &CallId, sdp: SessionDescription) -> Self {
        Self::SendLocalDescriptionAnswer {
            sdp,
            call_id: call_id.to_string(),
        }
    }

    pub fn candidate(call_id: &CallId, candidate: IceCandidate) -> Self {
        Self::SendCandidate {
            candidate,
            call_id: call_id.to_string(),
        }
    }

    pub fn remove_call(call_id: &CallId) -> Self {
        Self::RemoveCall {
            call_id: call_id.to_string(),
        }
    }

    pub fn claim_role(call_id: &CallId) -> Self {
        Self::ClaimRole {
            call_id: call_id.to_string(),
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            Self::Join { call_id }
            | Self::CheckForCall { call_id }
            | Self::SendLocalDescriptionOffer { call_id, .. }
            | Self::AnswerCall { call_id }
            | Self::SendLocalDescriptionAnswer { call_id, .. }
            | Self::SendCandidate { call_id, .. }
            | Self::RemoveCall { call_id }
            | Self::ClaimRole { call_id } => call_id,
        }
    }
}

/// Frames sent by the relay to a participant.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    CheckResult(bool),
    ReceiveRemoteDescriptionOffer(SessionDescription),
    ReceiveRemoteDescriptionAnswer(SessionDescription),
    ReceiveCandidate(IceCandidate),
    RoleAssigned(Role),
}
