use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::SinkExt;
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::board::BoardUpdate;
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before snapshotting so nothing published in between is lost;
    // clients apply card upserts idempotently anyway.
    let mut rx = state.board.subscribe();

    info!("board client connected");

    let send_task = tokio::spawn(async move {
        if send_snapshot(&mut sender, &state).await.is_err() {
            return;
        }

        loop {
            match rx.recv().await {
                Ok(update) => {
                    if send_update(&mut sender, &update).await.is_err() {
                        break;
                    }
                }
                // A lagging client gets a fresh snapshot instead of a gap.
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "board client lagged; resending snapshot");
                    if send_snapshot(&mut sender, &state).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("board client disconnected");
}

async fn send_snapshot(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
) -> Result<(), ()> {
    let snapshot = BoardUpdate::Snapshot {
        board: state.board.snapshot(),
    };
    send_update(sender, &snapshot).await
}

async fn send_update(
    sender: &mut SplitSink<WebSocket, Message>,
    update: &BoardUpdate,
) -> Result<(), ()> {
    let json = match serde_json::to_string(update) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "failed to serialize board update for ws");
            return Ok(());
        }
    };

    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}
