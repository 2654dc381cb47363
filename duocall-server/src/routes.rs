use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use duocall_lib::{
    signaling_server::{relay::Relay, ClientEvent},
    CallId,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::spawn;
use tower_http::trace::TraceLayer;
use tracing::{debug, trace, warn};

#[derive(Debug, Deserialize)]
pub struct CallQuery {
    #[serde(rename = "callId")]
    call_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CallResponse {
    #[serde(rename = "callId")]
    pub call_id: CallId,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HealthResponse {
    pub calls: usize,
}

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/ws", get(websocket))
        .route("/health", get(health))
        .route("/call", get(call))
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

async fn health(State(relay): State<Arc<Relay>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        calls: relay.call_count().await,
    })
}

/// A usable id is echoed back; anything else is redirected to a fresh one.
async fn call(Query(query): Query<CallQuery>) -> Response {
    match query.call_id.as_deref().map(CallId::parse) {
        Some(Ok(call_id)) => Json(CallResponse { call_id }).into_response(),
        _ => {
            let call_id = CallId::generate();
            debug!("[Call] Redirected to {}", call_id);
            Redirect::temporary(&format!("/call{}", call_id.to_query())).into_response()
        }
    }
}

async fn websocket(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, relay))
}

async fn serve_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (conn, mut rx) = relay.connect().await;
    let (mut sink, mut stream) = socket.split();

    let writer = spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!("failed to encode {:?}: {}", event, err);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                trace!("{} -> {}", conn, text);
                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => relay.handle(conn, event).await,
                    Err(err) => debug!("ignored frame from {}: {}", conn, err),
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!("connection {} errored: {}", conn, err);
                break;
            }
        }
    }

    relay.disconnect(conn).await;
    writer.abort();
}
