//! WebSocket endpoint.
//!
//! - GET /ws: upgrade to the client protocol. The caller's identity is taken
//!   from the `x-user-id` header, set by whatever authenticated the request.

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use tracing::{debug, info, instrument, warn};
use vmlease_id::UserId;

use super::error::ApiError;
use crate::connection::{ConnectionStateMachine, Outbound};
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(connect))
}

fn caller_identity(headers: &HeaderMap) -> Result<UserId, ApiError> {
    let raw = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing_identity", "Missing x-user-id header"))?;

    UserId::parse(raw).map_err(|e| ApiError::unauthorized("invalid_identity", e.to_string()))
}

async fn connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = caller_identity(&headers)?;
    Ok(ws.on_upgrade(move |socket| serve_connection(socket, state, user_id)))
}

async fn send(socket: &mut WebSocket, message: &Outbound) -> Result<(), axum::Error> {
    socket.send(Message::Text(message.to_json().into())).await
}

#[instrument(skip(socket, state), fields(user_id = %user_id))]
async fn serve_connection(mut socket: WebSocket, state: AppState, user_id: UserId) {
    let connection_id = match state.registry().admit(&user_id) {
        Ok(connection_id) => connection_id,
        Err(e) => {
            debug!(error = %e, "Closing duplicate connection");
            let _ = send(&mut socket, &Outbound::already_connected()).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let mut machine = ConnectionStateMachine::new(
        user_id.clone(),
        connection_id,
        state.manager().clone(),
        state.registry().clone(),
        state.catalog().clone(),
    );

    'conn: loop {
        tokio::select! {
            frame = socket.recv() => {
                let replies = match frame {
                    Some(Ok(Message::Text(text))) => machine.handle_text(text.as_str()),
                    Some(Ok(Message::Binary(_))) => machine.handle_binary(),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        state.registry().touch(&user_id, connection_id);
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                };

                for reply in &replies {
                    if send(&mut socket, reply).await.is_err() {
                        break 'conn;
                    }
                }
            }
            outcome = machine.next_outcome() => {
                if let Some(reply) = machine.resolve(outcome) {
                    if send(&mut socket, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    machine.close();
    info!(connection_id = %connection_id, "Connection finished");
}
