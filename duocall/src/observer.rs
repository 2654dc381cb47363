use duocall_lib::{
    connection::signaling::StreamIds,
    media::{CallObserver, CloseReason, RemoteTrack, StreamKind},
    negotiation::Phase,
};
use tracing::{debug, info};

/// Prints call progress for the person at the terminal.
pub struct ConsoleObserver;

impl CallObserver for ConsoleObserver {
    fn on_phase_changed(&mut self, phase: Phase) {
        debug!("phase {:?}", phase);
        match phase {
            Phase::DataChannelOpen => println!("Connected. Relay no longer needed."),
            Phase::SteadyState => println!("Call established."),
            _ => {}
        }
    }

    fn on_remote_stream_ids(&mut self, ids: &StreamIds) {
        info!(
            "remote streams user={} display={}",
            ids.user_stream_id(),
            ids.display_stream_id()
        );
    }

    fn on_remote_track_added(&mut self, stream: StreamKind, track: &RemoteTrack) {
        println!("Peer {} {} track started", stream, track.kind());
    }

    fn on_remote_track_removed(&mut self, stream: StreamKind, track: &RemoteTrack) {
        println!("Peer {} {} track ended", stream, track.kind());
    }

    fn on_camera_changed(&mut self, on: bool) {
        println!("Camera {}", if on { "on" } else { "off" });
    }

    fn on_muted_changed(&mut self, muted: bool) {
        println!("{}", if muted { "Muted" } else { "Unmuted" });
    }

    fn on_screen_share_changed(&mut self, sharing: bool) {
        println!(
            "Screen share {}",
            if sharing { "started" } else { "stopped" }
        );
    }

    fn on_closed(&mut self, reason: CloseReason) {
        println!(
            "{}",
            match reason {
                CloseReason::LocalHangup => "Call ended.",
                CloseReason::RemoteHangup => "Peer hung up.",
                CloseReason::ConnectionLost => "Connection lost.",
            }
        );
    }
}
