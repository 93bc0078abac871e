use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use deaddrop_shared::protocol::{ClientEvent, ServerEvent};
use deaddrop_shared::types::{ClientToken, PairingCode};

use crate::api::AppState;

/// Sender half of a connection's outbound queue. Session code clones this
/// to push events at a specific client; the writer task drains it into the
/// socket.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

/// Server pings every 30 seconds to surface dead connections that never
/// sent a close frame.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A missing pong within this window closes the connection.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Serialize and queue one event for a client. A closed channel means the
/// connection is already going away; the disconnect path cleans up.
pub fn send_event(tx: &ConnectionSender, event: &ServerEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = tx.send(Message::Text(json.into()));
        }
        Err(e) => warn!(error = %e, "Failed to encode event"),
    }
}

/// GET /ws — upgrade and hand the socket to a per-connection actor.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_connection(socket, state))
}

/// Actor for one client connection.
///
/// The socket splits into a writer task (drains the mpsc queue) and this
/// reader loop (dispatches frames). Joining a room registers the queue's
/// sender with the session, after which any part of the server can reach
/// this client.
async fn run_connection(socket: WebSocket, state: AppState) {
    let channel_id = Uuid::new_v4();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    debug!(channel = %channel_id, "Event channel opened");

    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Ping task: periodic pings, close on missed pong.
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        ping_timer.tick().await; // skip the immediate first tick

        loop {
            ping_timer.tick().await;
            if ping_tx.send(Message::Ping(Vec::new().into())).is_err() {
                break;
            }
            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Set once a joinRoom succeeds; needed to route the disconnect.
    let mut membership: Option<(PairingCode, ClientToken)> = None;

    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                handle_frame(&text, &tx, &state, channel_id, &mut membership).await;
            }
            Some(Ok(Message::Binary(_))) => {
                debug!(channel = %channel_id, "Ignoring binary frame on text protocol");
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = tx.send(Message::Pong(data));
            }
            Some(Ok(Message::Pong(_))) => {
                let _ = pong_tx.send(());
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(channel = %channel_id, reason = ?frame, "Client closed connection");
                break;
            }
            Some(Err(e)) => {
                warn!(channel = %channel_id, error = %e, "Receive error");
                break;
            }
            None => break,
        }
    }

    writer_handle.abort();
    ping_handle.abort();

    if let Some((code, token)) = membership {
        state.sessions.handle_disconnect(&code, channel_id).await;
        info!(code = %code, client = %token, channel = %channel_id, "Event channel closed");
    } else {
        debug!(channel = %channel_id, "Event channel closed before joining");
    }
}

/// Writer task: forwards queued messages to the socket until either side
/// goes away.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            break;
        }
    }
}

/// Decode and dispatch one client frame. All failures are reported as
/// `error` events; the connection itself stays up.
async fn handle_frame(
    text: &str,
    tx: &ConnectionSender,
    state: &AppState,
    channel_id: Uuid,
    membership: &mut Option<(PairingCode, ClientToken)>,
) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(channel = %channel_id, error = %e, "Undecodable frame");
            send_event(
                tx,
                &ServerEvent::Error {
                    message: "BadRequest".to_string(),
                },
            );
            return;
        }
    };

    match event {
        ClientEvent::JoinRoom { code, client_token } => {
            if membership.is_some() {
                send_event(
                    tx,
                    &ServerEvent::Error {
                        message: "AlreadyJoined".to_string(),
                    },
                );
                return;
            }

            match state
                .sessions
                .join_session(&code, client_token, channel_id, tx.clone())
                .await
            {
                Ok(outcome) => {
                    debug!(channel = %channel_id, rejoined = outcome.rejoined, "Room joined");
                    *membership = Some((code, outcome.token));
                }
                Err(e) => {
                    send_event(
                        tx,
                        &ServerEvent::Error {
                            message: e.event_reason().to_string(),
                        },
                    );
                }
            }
        }
        ClientEvent::SendMessage {
            match_code,
            client_token,
            message,
        } => {
            if let Err(e) = state
                .sessions
                .append_message(&match_code, client_token, message)
                .await
            {
                send_event(
                    tx,
                    &ServerEvent::Error {
                        message: e.event_reason().to_string(),
                    },
                );
            }
        }
    }
}
