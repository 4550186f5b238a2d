//! Live subscriber (C8): one task per accepted WebSocket connection. Sends
//! an `initial` bootstrap snapshot, then streams `update` deltas until the
//! connection closes, unsubscribing on every exit path.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::datastore::DataStore;
use crate::series::MultiSeries;

#[derive(Clone)]
pub struct WsState {
    pub datastore: Arc<DataStore>,
    pub subscriber_queue_capacity: usize,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum WireMessage {
    #[serde(rename = "initial")]
    Initial { series: serde_json::Value },
    #[serde(rename = "update")]
    Update { series: serde_json::Value },
}

pub async fn handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(move |socket| run(socket, state))
}

async fn run(mut socket: WebSocket, state: WsState) {
    let (tx, mut rx) = mpsc::channel::<MultiSeries>(state.subscriber_queue_capacity);
    let (id, initial) = state.datastore.subscribe(tx);

    let guard = UnsubscribeGuard {
        datastore: &state.datastore,
        id,
    };

    if send(&mut socket, &WireMessage::Initial { series: encode(&initial) }).await.is_err() {
        drop(guard);
        return;
    }

    loop {
        tokio::select! {
            delta = rx.recv() => {
                match delta {
                    Some(delta) => {
                        if send(&mut socket, &WireMessage::Update { series: encode(&delta) }).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // This is a server->client-only protocol (spec §6.2); any
                    // other inbound frame is simply ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    drop(guard);
}

fn encode(m: &MultiSeries) -> serde_json::Value {
    serde_json::to_value(m.encode()).unwrap_or(serde_json::Value::Null)
}

async fn send(socket: &mut WebSocket, msg: &WireMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}

/// Runs `DataStore::unsubscribe` on every exit path (clean close, send
/// error, or panic-unwind), matching spec §4.6 step 4.
struct UnsubscribeGuard<'a> {
    datastore: &'a DataStore,
    id: crate::datastore::SubscriberId,
}

impl Drop for UnsubscribeGuard<'_> {
    fn drop(&mut self) {
        self.datastore.unsubscribe(self.id);
    }
}
