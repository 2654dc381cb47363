use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

use crate::{
    connection::signaling::{IceCandidate, SessionDescription},
    negotiation::Role,
    CallId,
};

use super::{ClientEvent, ServerEvent};

pub const MAX_ROOM_MEMBERS: usize = 2;

pub type ConnectionId = u64;

struct Call {
    /// Only the most recent offer is ever handed out.
    latest_offer: Option<SessionDescription>,
    touched_at: Instant,
}

impl Call {
    fn new() -> Self {
        Self {
            latest_offer: None,
            touched_at: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.touched_at = Instant::now();
    }
}

#[derive(Default)]
struct RelayState {
    next_connection_id: ConnectionId,
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<ServerEvent>>,
    rooms: HashMap<CallId, Vec<ConnectionId>>,
    calls: HashMap<CallId, Call>,
}

impl RelayState {
    fn unicast(&self, conn: ConnectionId, event: ServerEvent) {
        let Some(tx) = self.connections.get(&conn) else {
            debug!("unicast to unknown connection {}", conn);
            return;
        };
        if tx.send(event).is_err() {
            debug!("connection {} is gone", conn);
        }
    }

    fn broadcast_except(&self, call_id: &CallId, conn: ConnectionId, event: ServerEvent) {
        let Some(members) = self.rooms.get(call_id) else {
            return;
        };
        for member in members.iter().copied().filter(|&x| x != conn) {
            self.unicast(member, event.clone());
        }
    }

    fn join(&mut self, conn: ConnectionId, call_id: &CallId) -> bool {
        let members = self.rooms.entry(call_id.clone()).or_default();
        if members.contains(&conn) {
            return true;
        }
        if members.len() >= MAX_ROOM_MEMBERS {
            warn!("[Call] Rejected third participant: {}", call_id);
            return false;
        }
        members.push(conn);
        trace!("connection {} joined {}", conn, call_id);
        true
    }

    fn touch(&mut self, call_id: &CallId) {
        if let Some(call) = self.calls.get_mut(call_id) {
            call.touch();
        }
    }
}

/// In-memory broker for the bootstrap phase of a call.
///
/// Every operation is best-effort: unknown calls, malformed ids and full
/// rooms degrade to silent no-ops on the wire.
#[derive(Default)]
pub struct Relay {
    state: Mutex<RelayState>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.next_connection_id += 1;
        let conn = state.next_connection_id;
        state.connections.insert(conn, tx);
        debug!("connection {} opened", conn);
        (conn, rx)
    }

    pub async fn disconnect(&self, conn: ConnectionId) {
        let mut state = self.state.lock().await;
        state.connections.remove(&conn);
        state.rooms.retain(|_, members| {
            members.retain(|&x| x != conn);
            !members.is_empty()
        });
        debug!("connection {} closed", conn);
    }

    pub async fn handle(&self, conn: ConnectionId, event: ClientEvent) {
        let call_id = match CallId::parse(event.call_id()) {
            Ok(call_id) => call_id,
            Err(err) => {
                debug!("ignored event from {}: {}", conn, err);
                return;
            }
        };
        match event {
            ClientEvent::Join { .. } => {
                self.join(conn, &call_id).await;
            }
            ClientEvent::CheckForCall { .. } => {
                self.check_for_call(conn, &call_id).await;
            }
            ClientEvent::SendLocalDescriptionOffer { sdp, .. } => {
                self.submit_offer(conn, &call_id, sdp).await
            }
            ClientEvent::AnswerCall { .. } => self.answer_call(conn, &call_id).await,
            ClientEvent::SendLocalDescriptionAnswer { sdp, .. } => {
                self.submit_answer(conn, &call_id, sdp).await
            }
            ClientEvent::SendCandidate { candidate, .. } => {
                self.submit_candidate(conn, &call_id, candidate).await
            }
            ClientEvent::RemoveCall { .. } => {
                self.remove_call(&call_id).await;
            }
            ClientEvent::ClaimRole { .. } => {
                self.claim_role(conn, &call_id).await;
            }
        }
    }

    pub async fn join(&self, conn: ConnectionId, call_id: &CallId) -> bool {
        self.state.lock().await.join(conn, call_id)
    }

    pub async fn check_for_call(&self, conn: ConnectionId, call_id: &CallId) -> bool {
        let state = self.state.lock().await;
        let exists = state.calls.contains_key(call_id);
        state.unicast(conn, ServerEvent::CheckResult(exists));
        exists
    }

    pub async fn submit_offer(&self, conn: ConnectionId, call_id: &CallId, sdp: SessionDescription) {
        let mut state = self.state.lock().await;
        let call = state.calls.entry(call_id.clone()).or_insert_with(|| {
            info!("[Call] Created: {}", call_id);
            Call::new()
        });
        call.latest_offer = Some(sdp.clone());
        call.touch();
        state.broadcast_except(call_id, conn, ServerEvent::ReceiveRemoteDescriptionOffer(sdp));
    }

    pub async fn answer_call(&self, conn: ConnectionId, call_id: &CallId) {
        let mut state = self.state.lock().await;
        if !state.calls.contains_key(call_id) {
            debug!("answer-call for unknown call {}", call_id);
            return;
        }
        if !state.join(conn, call_id) {
            return;
        }
        state.touch(call_id);
        let offer = state
            .calls
            .get(call_id)
            .and_then(|call| call.latest_offer.clone());
        if let Some(offer) = offer {
            info!("[Call] Answering: {}", call_id);
            state.unicast(conn, ServerEvent::ReceiveRemoteDescriptionOffer(offer));
        }
    }

    pub async fn submit_answer(&self, conn: ConnectionId, call_id: &CallId, sdp: SessionDescription) {
        let mut state = self.state.lock().await;
        state.touch(call_id);
        state.broadcast_except(call_id, conn, ServerEvent::ReceiveRemoteDescriptionAnswer(sdp));
    }

    pub async fn submit_candidate(
        &self,
        conn: ConnectionId,
        call_id: &CallId,
        candidate: IceCandidate,
    ) {
        let mut state = self.state.lock().await;
        state.touch(call_id);
        state.broadcast_except(call_id, conn, ServerEvent::ReceiveCandidate(candidate));
    }

    /// Returns whether a record was removed. Removing twice is fine.
    pub async fn remove_call(&self, call_id: &CallId) -> bool {
        let removed = self.state.lock().await.calls.remove(call_id).is_some();
        if removed {
            info!("[Call] Removed: {}", call_id);
        }
        removed
    }

    /// Atomic join-or-create: the first claimant becomes the caller, the
    /// second the callee. A full room gets no reply.
    pub async fn claim_role(&self, conn: ConnectionId, call_id: &CallId) -> Option<Role> {
        let mut state = self.state.lock().await;
        if !state.join(conn, call_id) {
            return None;
        }
        let role = if let Some(call) = state.calls.get_mut(call_id) {
            call.touch();
            Role::Callee
        } else {
            info!("[Call] Created: {}", call_id);
            state.calls.insert(call_id.clone(), Call::new());
            Role::Caller
        };
        state.unicast(conn, ServerEvent::RoleAssigned(role));
        Some(role)
    }

    /// Drops call records untouched for longer than `ttl`.
    pub async fn sweep(&self, now: Instant, ttl: Duration) -> usize {
        let mut state = self.state.lock().await;
        let before = state.calls.len();
        state.calls.retain(|call_id, call| {
            let keep = now.saturating_duration_since(call.touched_at) <= ttl;
            if !keep {
                info!("[Call] Expired: {}", call_id);
            }
            keep
        });
        before - state.calls.len()
    }

    pub async fn has_call(&self, call_id: &CallId) -> bool {
        self.state.lock().await.calls.contains_key(call_id)
    }

    pub async fn call_count(&self) -> usize {
        self.state.lock().await.calls.len()
    }

    pub async fn room_size(&self, call_id: &CallId) -> usize {
        self.state
            .lock()
            .await
            .rooms
            .get(call_id)
            .map_or(0, |members| members.len())
    }
}
