use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::time::{interval, Duration, Instant};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::event::{ServiceEvent, STATUS_TOPIC, STATUS_UPDATED};

use super::routes::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(5);
const PONG_DEADLINE: Duration = Duration::from_secs(10);

type Outbound = SplitSink<WebSocket, Message>;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_subscriber(socket, state))
}

// False once the client is gone.
async fn push<T: Serialize>(outbound: &mut Outbound, message: &T) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to serialize push message");
            return true;
        }
    };
    outbound.send(Message::Text(json)).await.is_ok()
}

async fn serve_subscriber(socket: WebSocket, state: AppState) {
    let (mut outbound, mut inbound) = socket.split();
    info!("websocket subscriber connected");

    // Subscribe before the snapshot so no update falls in between
    let mut updates = BroadcastStream::new(state.broadcaster.subscribe());

    for payload in state.manager.list_services().await {
        let snapshot = ServiceEvent {
            topic: STATUS_TOPIC.to_string(),
            event: STATUS_UPDATED.to_string(),
            payload,
        };
        if !push(&mut outbound, &snapshot).await {
            return;
        }
    }

    let mut ping = interval(PING_INTERVAL);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            update = updates.next() => match update {
                Some(Ok(event)) => {
                    if !push(&mut outbound, &event).await {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(skipped, "websocket subscriber lagged, updates dropped");
                }
                None => break,
            },

            frame = inbound.next() => match frame {
                Some(Ok(Message::Ping(data))) => {
                    last_seen = Instant::now();
                    if outbound.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => last_seen = Instant::now(),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },

            _ = ping.tick() => {
                if last_seen.elapsed() > PONG_DEADLINE {
                    debug!("websocket subscriber stopped answering pings");
                    break;
                }
                if outbound.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("websocket subscriber disconnected");
}
