use anyhow::{bail, Result};
use async_trait::async_trait;
use duocall_lib::media::{CapturedTrack, LocalTrack, MediaDevices, TrackKind};
use tracing::debug;

/// Capture devices without hardware behind them.
///
/// Tracks carry no samples; the remote side still sees them negotiated.
pub struct SyntheticDevices {
    screen_available: bool,
}

impl SyntheticDevices {
    pub fn new(screen_available: bool) -> Self {
        Self { screen_available }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn request_user_media(&mut self, audio: bool, video: bool) -> Result<Vec<CapturedTrack>> {
        let mut tracks = vec![];
        if audio {
            tracks.push(CapturedTrack::new(TrackKind::Audio, "microphone".into()));
        }
        if video {
            tracks.push(CapturedTrack::new(TrackKind::Video, "camera".into()));
        }
        Ok(tracks)
    }

    async fn request_display_media(&mut self) -> Result<Vec<CapturedTrack>> {
        if !self.screen_available {
            bail!("Screen capture is not available");
        }
        Ok(vec![CapturedTrack::new(TrackKind::Video, "screen".into())])
    }

    fn stop(&mut self, track: &LocalTrack) {
        debug!("stopped {} track {}", track.kind(), track.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn user_media_follows_constraints() {
        let mut devices = SyntheticDevices::new(true);
        let tracks = devices.request_user_media(true, false).await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].kind(), TrackKind::Audio);

        let tracks = devices.request_user_media(true, true).await.unwrap();
        assert_eq!(tracks.len(), 2);
    }

    #[tokio::test]
    async fn screen_can_be_unavailable() {
        assert!(SyntheticDevices::new(false)
            .request_display_media()
            .await
            .is_err());
        assert_eq!(
            SyntheticDevices::new(true)
                .request_display_media()
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
