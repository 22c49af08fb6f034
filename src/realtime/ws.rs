use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{ClientMessage, ServerMessage};
use super::FanoutHub;

/// Drive one WebSocket session: register with the hub, pump the bounded
/// outbound queue onto the socket, and dispatch inbound control messages.
///
/// The delivery pump emits a `ping` whenever the queue stays empty for a
/// full heartbeat period; the sweeper closes the connection when the peer
/// stops replying.
pub async fn serve_socket(socket: WebSocket, hub: FanoutHub, client_id: Option<String>) {
    let (id, mut rx) = match hub.connect(client_id).await {
        Ok(conn) => conn,
        Err(e) => {
            // Over capacity: tell the client why, then drop the socket.
            let mut socket = socket;
            let frame = ServerMessage::Error {
                message: e.to_string(),
            };
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = socket.send(Message::Text(text.into())).await;
            }
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    let heartbeat = hub.heartbeat();

    // Delivery task: drains the queue in order; an idle queue turns into a
    // heartbeat ping instead of waiting forever.
    let pump = tokio::spawn(async move {
        loop {
            let frame = match timeout(heartbeat, rx.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => break, // hub dropped the connection
                Err(_) => ServerMessage::Ping,
            };
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "failed to serialize frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(inbound) = stream.next().await {
        let text = match inbound {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue, // binary/ping/pong frames carry no protocol
        };

        dispatch(&hub, id, &text).await;
    }

    hub.disconnect(id).await;
    pump.abort();
}

/// Handle one inbound frame against the hub; factored out of the socket
/// loop so the dispatch rules are testable without a live socket.
async fn dispatch(hub: &FanoutHub, id: Uuid, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { topic }) => {
            hub.subscribe(id, &topic).await;
            hub.send(id, ServerMessage::Subscribed { topic }).await;
        }
        Ok(ClientMessage::Unsubscribe { topic }) => {
            hub.unsubscribe(id, &topic).await;
            hub.send(id, ServerMessage::Unsubscribed { topic }).await;
        }
        Ok(ClientMessage::Pong) => hub.record_pong(id).await,
        Ok(ClientMessage::Echo { data }) => {
            hub.send(id, ServerMessage::Echo { data }).await;
        }
        Err(e) => {
            debug!(connection_id = %id, error = %e, "unparseable client message");
            hub.send(
                id,
                ServerMessage::Error {
                    message: format!("invalid message: {e}"),
                },
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn subscribe_replies_and_registers() {
        let hub = FanoutHub::new(10, 10, Duration::from_secs(30));
        let (id, mut rx) = hub.connect(None).await.unwrap();

        dispatch(&hub, id, r#"{"type":"subscribe","topic":"alerts"}"#).await;

        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::Subscribed { topic: "alerts".into() }
        );
        assert_eq!(hub.broadcast(ServerMessage::Ping, Some("alerts")).await, 1);
    }

    #[tokio::test]
    async fn echo_reflects_payload() {
        let hub = FanoutHub::new(10, 10, Duration::from_secs(30));
        let (id, mut rx) = hub.connect(None).await.unwrap();

        dispatch(&hub, id, r#"{"type":"echo","data":{"n":1}}"#).await;

        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::Echo { data: serde_json::json!({"n":1}) }
        );
    }

    #[tokio::test]
    async fn malformed_message_yields_error_frame() {
        let hub = FanoutHub::new(10, 10, Duration::from_secs(30));
        let (id, mut rx) = hub.connect(None).await.unwrap();

        dispatch(&hub, id, r#"{"type":"detonate"}"#).await;

        match rx.recv().await.unwrap() {
            ServerMessage::Error { message } => assert!(message.contains("invalid message")),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
