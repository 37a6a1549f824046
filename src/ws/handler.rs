//! WebSocket upgrade handler and session loop
//!
//! A session owns one side of the socket split and a subscription to the
//! broadcast channel of whichever match the player is seated in. The lobby
//! seats players asynchronously, so an unseated session polls the registry
//! until its seat appears, then attaches by sending a `JoinMatch` input to
//! the match task.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{MatchHandle, PlayerInput};
use crate::http::middleware::verify_jwt;
use crate::util::rate_limit::PlayerRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// JWT token for authentication
    pub token: String,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Verify JWT token before upgrading
    match verify_jwt(&query.token, &state.config.supabase_jwt_secret) {
        Ok(claims) => {
            info!(user_id = %claims.sub, "WebSocket upgrade for authenticated user");
            ws.on_upgrade(move |socket| handle_socket(socket, claims.sub, state))
        }
        Err(e) => {
            error!(error = %e, "WebSocket auth failed");
            Response::builder()
                .status(401)
                .body("Unauthorized".into())
                .unwrap_or_default()
        }
    }
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, user_id: Uuid, state: AppState) {
    info!(user_id = %user_id, "New WebSocket connection");

    let (mut ws_sink, mut ws_stream) = socket.split();

    let welcome = ServerMsg::Welcome {
        user_id,
        server_time: unix_millis(),
    };
    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(user_id = %user_id, error = %e, "Failed to send welcome");
        return;
    }

    let rate_limiter = PlayerRateLimiter::new();
    let mut seat: Option<MatchHandle> = None;
    let mut match_rx: Option<broadcast::Receiver<ServerMsg>> = None;
    let mut seat_poll = tokio::time::interval(tokio::time::Duration::from_millis(250));

    loop {
        tokio::select! {
            maybe_frame = ws_stream.next() => {
                let Some(frame) = maybe_frame else { break };
                match frame {
                    Ok(Message::Text(text)) => {
                        if !rate_limiter.check_input() {
                            warn!(user_id = %user_id, "Rate limited input message");
                            continue;
                        }
                        let msg = match serde_json::from_str::<ClientMsg>(&text) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!(user_id = %user_id, error = %e, "Failed to parse client message");
                                continue;
                            }
                        };

                        if seat.is_none() {
                            // A seat may have appeared since the last poll.
                            if let Some(handle) = state.registry.match_for_player(&user_id) {
                                attach(&mut seat, &mut match_rx, handle, user_id).await;
                            }
                        }

                        let Some(handle) = &seat else {
                            debug!(user_id = %user_id, "Input before a match was joined, dropping");
                            continue;
                        };
                        let input = PlayerInput {
                            user_id,
                            msg,
                            received_at: unix_millis(),
                        };
                        if handle.input_tx.send(input).await.is_err() {
                            // Match task is gone; free the seat.
                            seat = None;
                            match_rx = None;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!(user_id = %user_id, "Client initiated close");
                        break;
                    }
                    Ok(Message::Binary(_)) => {
                        warn!(user_id = %user_id, "Received binary message, ignoring");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(user_id = %user_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            broadcast_result = next_broadcast(&mut match_rx) => {
                match broadcast_result {
                    Ok(msg) => {
                        if !deliver_to(&msg, user_id) {
                            continue;
                        }
                        if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                            debug!(user_id = %user_id, error = %e, "WebSocket send failed");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // The next full snapshot supersedes anything missed.
                        warn!(user_id = %user_id, lagged = n, "Client lagged behind broadcasts");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(user_id = %user_id, "Match broadcast closed");
                        seat = None;
                        match_rx = None;
                    }
                }
            }
            _ = seat_poll.tick(), if seat.is_none() => {
                if let Some(handle) = state.registry.match_for_player(&user_id) {
                    attach(&mut seat, &mut match_rx, handle, user_id).await;
                }
            }
        }
    }

    // Signal disconnect to the match task and drop any queue entry.
    if let Some(handle) = &seat {
        let _ = handle
            .input_tx
            .send(PlayerInput {
                user_id,
                msg: ClientMsg::LeaveMatch,
                received_at: unix_millis(),
            })
            .await;
    }
    state.lobby.leave_queue(user_id).await;

    info!(user_id = %user_id, "WebSocket connection closed");
}

/// Subscribe to a match and announce the player to its task.
async fn attach(
    seat: &mut Option<MatchHandle>,
    match_rx: &mut Option<broadcast::Receiver<ServerMsg>>,
    handle: MatchHandle,
    user_id: Uuid,
) {
    *match_rx = Some(handle.broadcast_tx.subscribe());
    let join = PlayerInput {
        user_id,
        msg: ClientMsg::JoinMatch {
            match_id: Some(handle.id),
        },
        received_at: unix_millis(),
    };
    if handle.input_tx.send(join).await.is_err() {
        warn!(user_id = %user_id, match_id = %handle.id, "Failed to attach to match");
        *match_rx = None;
        return;
    }
    info!(user_id = %user_id, match_id = %handle.id, "Session attached to match");
    *seat = Some(handle);
}

/// Resolves to the next broadcast message, or never when unseated.
async fn next_broadcast(
    rx: &mut Option<broadcast::Receiver<ServerMsg>>,
) -> Result<ServerMsg, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Addressed messages go only to their recipient; everything else fans out.
fn deliver_to(msg: &ServerMsg, user_id: Uuid) -> bool {
    match msg {
        ServerMsg::Error { to, .. } | ServerMsg::PendingAction { to, .. } => *to == user_id,
        _ => true,
    }
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json)).await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::PendingPrompt;

    #[test]
    fn addressed_messages_reach_only_their_recipient() {
        let me = Uuid::from_u128(1);
        let other = Uuid::from_u128(2);

        let err = ServerMsg::Error {
            to: other,
            code: "not_your_turn".to_string(),
            message: "not your turn".to_string(),
        };
        assert!(!deliver_to(&err, me));
        assert!(deliver_to(&err, other));

        let prompt = ServerMsg::PendingAction {
            to: me,
            prompt: PendingPrompt::DefenseRequired {
                attacker: other,
                deadline_ms: 30_000,
            },
        };
        assert!(deliver_to(&prompt, me));
        assert!(!deliver_to(&prompt, other));

        let pong = ServerMsg::Pong { t: 5 };
        assert!(deliver_to(&pong, me));
        assert!(deliver_to(&pong, other));
    }
}
