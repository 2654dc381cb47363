use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use derive_new::new;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{connection::signaling::StreamIds, negotiation::Phase};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        })
    }
}

/// Which of the two per-participant streams a track belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Camera and microphone.
    User,
    /// Screen share.
    Display,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::User => "user",
            StreamKind::Display => "display",
        })
    }
}

/// A track handed out by a capture device, not yet bound to a stream.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters, new)]
pub struct CapturedTrack {
    #[getset(get_copy = "pub")]
    kind: TrackKind,
    #[getset(get = "pub")]
    label: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters)]
pub struct LocalTrack {
    #[getset(get = "pub")]
    id: String,
    #[getset(get_copy = "pub")]
    kind: TrackKind,
    #[getset(get = "pub")]
    label: String,
    #[getset(get = "pub")]
    stream_id: String,
    #[getset(get_copy = "pub")]
    enabled: bool,
}

/// A stream container whose id stays stable while tracks come and go.
#[derive(Clone, Debug, Getters)]
pub struct LocalStream {
    #[getset(get = "pub")]
    id: String,
    #[getset(get = "pub")]
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks: vec![],
        }
    }

    pub fn add(&mut self, captured: CapturedTrack) -> LocalTrack {
        let track = LocalTrack {
            id: Uuid::new_v4().to_string(),
            kind: captured.kind,
            label: captured.label,
            stream_id: self.id.clone(),
            enabled: true,
        };
        self.tracks.push(track.clone());
        track
    }

    pub fn take_kind(&mut self, kind: TrackKind) -> Vec<LocalTrack> {
        let (taken, kept) = self.tracks.drain(..).partition(|x| x.kind == kind);
        self.tracks = kept;
        taken
    }

    pub fn take_all(&mut self) -> Vec<LocalTrack> {
        self.tracks.drain(..).collect()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|x| x.kind == kind)
    }

    /// Returns how many tracks changed.
    pub fn set_enabled(&mut self, kind: TrackKind, enabled: bool) -> usize {
        let mut changed = 0;
        for track in self.tracks.iter_mut().filter(|x| x.kind == kind) {
            if track.enabled != enabled {
                track.enabled = enabled;
                changed += 1;
            }
        }
        changed
    }
}

impl Default for LocalStream {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters, new)]
pub struct RemoteTrack {
    #[getset(get = "pub")]
    stream_id: String,
    #[getset(get = "pub")]
    track_id: String,
    #[getset(get_copy = "pub")]
    kind: TrackKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    LocalHangup,
    RemoteHangup,
    ConnectionLost,
}

/// Capture backend. Implementations decide what a camera or a screen is.
#[async_trait]
pub trait MediaDevices: Send {
    async fn request_user_media(&mut self, audio: bool, video: bool) -> Result<Vec<CapturedTrack>>;
    /// Fails when the user declines to pick a screen.
    async fn request_display_media(&mut self) -> Result<Vec<CapturedTrack>>;
    fn stop(&mut self, _track: &LocalTrack) {}
}

/// Presentation side of a call. Every method defaults to doing nothing.
pub trait CallObserver: Send {
    fn on_phase_changed(&mut self, _phase: Phase) {}
    fn on_remote_stream_ids(&mut self, _ids: &StreamIds) {}
    fn on_remote_track_added(&mut self, _stream: StreamKind, _track: &RemoteTrack) {}
    fn on_remote_track_removed(&mut self, _stream: StreamKind, _track: &RemoteTrack) {}
    fn on_camera_changed(&mut self, _on: bool) {}
    fn on_muted_changed(&mut self, _muted: bool) {}
    fn on_screen_share_changed(&mut self, _sharing: bool) {}
    fn on_closed(&mut self, _reason: CloseReason) {}
}
