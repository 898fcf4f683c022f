//! Client-facing signaling over WebSocket.
//!
//! One task per connected browser: a select loop that multiplexes inbound
//! frames with outbound messages (answers, candidates, errors) funneled
//! through a channel. Malformed frames get an error reply and the channel
//! stays open; socket teardown releases whatever the session holds.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use mediagate_protocol::{ClientMessage, IceCandidate, ServerMessage, message_kind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::negotiate::{StartError, start_session};
use crate::session::SessionRecord;
use crate::web::AppState;

/// Drive one client's signaling channel until it closes.
pub async fn handle_client_ws(mut socket: WebSocket, session_id: Uuid, state: Arc<AppState>) {
    info!(session = %session_id, "Signaling channel open");

    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(64);
    let (ice_tx, mut ice_rx) = mpsc::channel::<IceCandidate>(64);

    // Candidates gathered by the media server become iceCandidate messages.
    let forward_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(candidate) = ice_rx.recv().await {
            if forward_tx
                .send(ServerMessage::IceCandidate { candidate })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                // out_tx is held above, so this channel cannot close here
                let Some(msg) = outbound else { break };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(session = %session_id, "Unserializable outbound message: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(&state, session_id, &text, &out_tx, &ice_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session = %session_id, "Signaling socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    forwarder.abort();
    teardown(&state, session_id).await;
    info!(session = %session_id, "Signaling channel closed");
}

/// Parse one frame and act on it. Unknown or malformed frames answer with
/// an error message naming the offending kind, matching what browser-side
/// code expects to log.
async fn dispatch(
    state: &Arc<AppState>,
    session_id: Uuid,
    raw: &str,
    out_tx: &mpsc::Sender<ServerMessage>,
    ice_tx: &mpsc::Sender<IceCandidate>,
) {
    match serde_json::from_str::<ClientMessage>(raw) {
        Ok(msg) => handle_message(state, session_id, msg, out_tx, ice_tx).await,
        Err(_) => {
            let kind = message_kind(raw).unwrap_or_else(|| raw.chars().take(64).collect());
            warn!(session = %session_id, %kind, "Invalid signaling message");
            let _ = out_tx
                .send(ServerMessage::Error {
                    message: format!("Invalid message {kind}"),
                })
                .await;
        }
    }
}

pub(crate) async fn handle_message(
    state: &Arc<AppState>,
    session_id: Uuid,
    msg: ClientMessage,
    out_tx: &mpsc::Sender<ServerMessage>,
    ice_tx: &mpsc::Sender<IceCandidate>,
) {
    match msg {
        ClientMessage::Start { sdp_offer } => {
            // Claim the session now so a second start (or a candidate racing
            // the spawn) is ordered against this one.
            let token = match state.sessions.begin(session_id).await {
                Ok(token) => token,
                Err(e) => {
                    warn!(session = %session_id, "Rejected start: {e}");
                    let _ = out_tx
                        .send(ServerMessage::Error {
                            message: e.to_string(),
                        })
                        .await;
                    return;
                }
            };

            // The negotiation runs concurrently so stop and candidate
            // messages stay responsive during the backend round trips.
            let state = Arc::clone(state);
            let out_tx = out_tx.clone();
            let ice_tx = ice_tx.clone();
            tokio::spawn(async move {
                let result = start_session(
                    &state.backend,
                    &state.sessions,
                    &state.config.rtp,
                    session_id,
                    token,
                    &sdp_offer,
                    ice_tx,
                )
                .await;
                match result {
                    Ok(sdp_answer) => {
                        let _ = out_tx
                            .send(ServerMessage::StartResponse { sdp_answer })
                            .await;
                    }
                    Err(StartError::Cancelled) => {
                        debug!(session = %session_id, "Negotiation cancelled by stop");
                    }
                    Err(StartError::Backend(e)) => {
                        warn!(session = %session_id, "Negotiation failed: {e}");
                        let _ = out_tx
                            .send(ServerMessage::Error {
                                message: e.to_string(),
                            })
                            .await;
                    }
                }
            });
        }
        ClientMessage::IceCandidate { candidate } => {
            if let Err(e) = state.sessions.add_candidate(session_id, candidate).await {
                warn!(session = %session_id, "Candidate rejected by media server: {e}");
                let _ = out_tx
                    .send(ServerMessage::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
        ClientMessage::Stop => {
            // The client stays connected, so the session entry survives and
            // an immediate new start is allowed.
            if let Some(record) = state.sessions.stop(session_id).await {
                info!(session = %session_id, pipeline = %record.pipeline.id(), "Releasing pipeline");
                release_record(&record).await;
            }
        }
    }
}

/// Release whatever the session holds once its signaling channel is gone.
/// Unlike an explicit stop, nothing can reach the session again, so the
/// registry entry is retired too. Safe to run twice.
pub(crate) async fn teardown(state: &Arc<AppState>, session_id: Uuid) {
    if let Some(record) = state.sessions.close(session_id).await {
        info!(session = %session_id, pipeline = %record.pipeline.id(), "Releasing pipeline");
        release_record(&record).await;
    }
}

async fn release_record(record: &SessionRecord) {
    if let Err(e) = record.pipeline.release().await {
        warn!(pipeline = %record.pipeline.id(), "Pipeline release failed: {e}");
    }
}
