//! WebSocket endpoint connections.
//!
//! Each accepted socket runs a receive loop, publishing text frames on the
//! endpoint's recv topic, and a send loop writing everything produced on the
//! send topic. Either loop ending cancels the other.

use super::{connection_buffer, payload_text, websocket_recv_topic, websocket_send_topic};
use super::{Inner, StreamKind};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};
use warp::ws::{Message, WebSocket};

pub(super) async fn serve(inner: Arc<Inner>, path: String, socket: WebSocket) {
    let Some(conn) = inner.open_connection(StreamKind::WebSocket, &path) else {
        debug!("Websocket endpoint {} closed before the upgrade finished", path);
        return;
    };
    let broker = inner.broker().clone();
    let recv_topic = websocket_recv_topic(&path);
    let send_topic = websocket_send_topic(&path);
    let consumer_id = format!("ws/send/{}", conn.id);

    let mut outgoing =
        match broker.create_sub(&send_topic, false, &consumer_id, connection_buffer()) {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Websocket endpoint {} cannot subscribe {}: {}", path, send_topic, e);
                inner.close_connection(StreamKind::WebSocket, &path, conn.id);
                return;
            }
        };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let token = conn.ctx.token().clone();

    let send = async {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                payload = outgoing.recv() => {
                    let Some(payload) = payload else { break };
                    let Some(text) = payload_text(&payload) else { continue };
                    if let Err(e) = ws_tx.send(Message::text(text)).await {
                        debug!("Websocket connection {} write error: {}", conn.id, e);
                        break;
                    }
                }
            }
        }
        token.cancel();
        let _ = ws_tx.close().await;
    };

    let recv = async {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                msg = ws_rx.next() => match msg {
                    Some(Ok(msg)) if msg.is_text() => {
                        broker.produce_bytes(&conn.ctx, &recv_topic, Bytes::copy_from_slice(msg.as_bytes()));
                    }
                    Some(Ok(msg)) if msg.is_close() => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Websocket connection {} read error: {}", conn.id, e);
                        break;
                    }
                    None => break,
                }
            }
        }
        token.cancel();
    };

    tokio::join!(send, recv);

    broker.close_source_consumer_channel(&send_topic, &consumer_id);
    inner.close_connection(StreamKind::WebSocket, &path, conn.id);
    info!("Websocket connection {} on {} closed", conn.id, path);
}

#[cfg(test)]
mod tests {
    use super::super::GlobalServerManager;
    use crate::config::HttpServerConfig;
    use crate::context::StreamContext;
    use crate::pubsub::{Payload, TopicBroker};
    use futures_util::{SinkExt, StreamExt};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    fn manager(broker: &Arc<TopicBroker>) -> GlobalServerManager {
        GlobalServerManager::new(
            broker.clone(),
            HttpServerConfig {
                ip: "127.0.0.1".to_string(),
                port: 0,
                tls: None,
                cors: false,
            },
        )
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let broker = Arc::new(TopicBroker::new());
        let manager = manager(&broker);
        let ctx = StreamContext::new("rule1", "ws", 0);
        let (recv, send) = manager.register_websocket_endpoint(&ctx, "/ws").unwrap();
        let mut received = broker.create_sub(&recv, false, "test", 8).unwrap();

        let url = format!("ws://{}/ws", manager.local_addr().unwrap());
        let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        wait_for(|| manager.websocket_connections("/ws") == 1).await;

        client.send(Message::Text("hello".into())).await.unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(payload, Payload::Bytes(b) if &b[..] == b"hello"));

        wait_for(|| broker.consumer_count(&send) == 1).await;
        broker.produce_bytes(&ctx, &send, bytes::Bytes::from_static(b"{\"a\":1}"));
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame.into_text().unwrap(), "{\"a\":1}");

        manager.unregister_websocket_endpoint("/ws").await.unwrap();
        assert_eq!(broker.consumer_count(&send), 0);
        assert!(manager.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_unregister_waits_for_connections() {
        let broker = Arc::new(TopicBroker::new());
        let manager = manager(&broker);
        let ctx = StreamContext::new("rule1", "ws", 0);
        manager.register_websocket_endpoint(&ctx, "/live").unwrap();
        let url = format!("ws://{}/live", manager.local_addr().unwrap());

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
            clients.push(client);
        }
        wait_for(|| manager.websocket_connections("/live") == 3).await;

        manager.unregister_websocket_endpoint("/live").await.unwrap();
        assert_eq!(manager.websocket_connections("/live"), 0);

        // every client observes the close
        for mut client in clients {
            let end = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match client.next().await {
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => {}
                    }
                }
            })
            .await;
            assert!(end.is_ok());
        }
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_upgraded() {
        let broker = Arc::new(TopicBroker::new());
        let manager = manager(&broker);
        let ctx = StreamContext::new("rule1", "ws", 0);
        manager.register_websocket_endpoint(&ctx, "/ws").unwrap();
        let url = format!("ws://{}/other", manager.local_addr().unwrap());
        assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());
        manager.unregister_websocket_endpoint("/ws").await.unwrap();
    }
}
