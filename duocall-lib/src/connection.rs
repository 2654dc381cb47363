mod data_channel;
mod peer_connection;
pub mod signaling;

pub use self::{
    data_channel::{DataChannel, SIGNALLING_CHANNEL_LABEL},
    peer_connection::{PeerConnection, DEFAULT_ICE_SERVER},
};
