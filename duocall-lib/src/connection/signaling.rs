pub mod socket;

use anyhow::{bail, Result};
use derive_new::new;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// `{type, sdp}` as produced by `RTCPeerConnection.localDescription`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, CopyGetters, Getters, new)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    #[getset(get_copy = "pub")]
    sdp_type: SdpType,
    #[get = "pub"]
    sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Offer, sdp.into())
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Answer, sdp.into())
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

impl TryFrom<RTCSessionDescription> for SessionDescription {
    type Error = anyhow::Error;

    fn try_from(value: RTCSessionDescription) -> Result<Self> {
        let sdp_type = match value.sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Rollback => SdpType::Rollback,
            RTCSdpType::Unspecified => bail!("unspecified sdp type"),
        };
        Ok(Self::new(sdp_type, value.sdp))
    }
}

impl TryFrom<SessionDescription> for RTCSessionDescription {
    type Error = anyhow::Error;

    fn try_from(value: SessionDescription) -> Result<Self> {
        Ok(match value.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(value.sdp)?,
            SdpType::Pranswer => RTCSessionDescription::pranswer(value.sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(value.sdp)?,
            SdpType::Rollback => bail!("rollback descriptions are not supported"),
        })
    }
}

/// `RTCIceCandidate.toJSON()` shape.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(value: RTCIceCandidateInit) -> Self {
        Self {
            candidate: value.candidate,
            sdp_mid: value.sdp_mid,
            sdp_mline_index: value.sdp_mline_index,
            username_fragment: value.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(value: IceCandidate) -> Self {
        Self {
            candidate: value.candidate,
            sdp_mid: value.sdp_mid,
            sdp_mline_index: value.sdp_mline_index,
            username_fragment: value.username_fragment,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelAction {
    Disconnect,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, Getters, new)]
pub struct StreamIds {
    #[serde(rename = "userStreamID")]
    #[get = "pub"]
    user_stream_id: String,
    #[serde(rename = "displayStreamID")]
    #[get = "pub"]
    display_stream_id: String,
}

/// Messages carried on the direct data channel once the relay is gone.
/// Each JSON object has exactly one of the shapes below.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SignalingMessage {
    Sdp { sdp: SessionDescription },
    Candidate { candidate: IceCandidate },
    StreamIds(StreamIds),
    Action { action: ChannelAction },
}

impl SignalingMessage {
    pub fn disconnect() -> Self {
        Self::Action {
            action: ChannelAction::Disconnect,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
