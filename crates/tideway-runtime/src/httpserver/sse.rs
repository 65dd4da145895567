//! Server-sent events endpoints.

use super::{connection_buffer, payload_text, sse_topic, Inner, StreamKind};
use futures_util::{future, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use warp::reply::Response;
use warp::{Rejection, Reply};

/// Unsubscribes and releases the connection once warp drops the stream.
struct ConnectionGuard {
    inner: Arc<Inner>,
    path: String,
    topic: String,
    consumer_id: String,
    conn: super::Connection,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner
            .broker()
            .close_source_consumer_channel(&self.topic, &self.consumer_id);
        self.inner
            .close_connection(StreamKind::Sse, &self.path, self.conn.id);
        info!("Sse connection {} on {} closed", self.conn.id, self.path);
    }
}

pub(super) fn serve(inner: Arc<Inner>, path: &str) -> Result<Response, Rejection> {
    let Some(conn) = inner.open_connection(StreamKind::Sse, path) else {
        return Err(warp::reject::not_found());
    };
    let topic = sse_topic(path);
    let consumer_id = format!("sse/{}", conn.id);
    let rx = match inner
        .broker()
        .create_sub(&topic, false, &consumer_id, connection_buffer())
    {
        Ok(rx) => rx,
        Err(e) => {
            warn!("Sse endpoint {} cannot subscribe {}: {}", path, topic, e);
            inner.close_connection(StreamKind::Sse, path, conn.id);
            return Err(warp::reject::not_found());
        }
    };

    let token = conn.ctx.token().clone();
    let guard = ConnectionGuard {
        inner: inner.clone(),
        path: path.to_string(),
        topic,
        consumer_id,
        conn,
    };
    let events = ReceiverStream::new(rx)
        .filter_map(|payload| future::ready(payload_text(&payload)))
        .map(move |text| {
            let _held = &guard;
            Ok::<_, Infallible>(warp::sse::Event::default().data(text))
        })
        .take_until(async move { token.cancelled().await });

    Ok(warp::sse::reply(warp::sse::keep_alive().stream(events)).into_response())
}

#[cfg(test)]
mod tests {
    use super::super::GlobalServerManager;
    use crate::config::HttpServerConfig;
    use crate::context::StreamContext;
    use crate::pubsub::TopicBroker;
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tideway_core::Tuple;

    #[tokio::test]
    async fn test_sse_stream() {
        let broker = Arc::new(TopicBroker::new());
        let manager = GlobalServerManager::new(
            broker.clone(),
            HttpServerConfig {
                ip: "127.0.0.1".to_string(),
                port: 0,
                tls: None,
                cors: false,
            },
        );
        let ctx = StreamContext::new("rule1", "sse", 0);
        let topic = manager.register_sse_endpoint(&ctx, "/events").unwrap();
        let url = format!("http://{}/events", manager.local_addr().unwrap());

        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 200);
        for _ in 0..200 {
            if broker.consumer_count(&topic) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.sse_connections("/events"), 1);

        broker.produce(&ctx, &topic, Tuple::new("t").with_field("temp", 21));
        let mut body = response.bytes_stream();
        let mut text = String::new();
        while !text.contains("{\"temp\":21}") {
            let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(text.starts_with("data:"));

        manager.unregister_sse_endpoint("/events").await.unwrap();
        assert_eq!(broker.consumer_count(&topic), 0);
        assert!(manager.local_addr().is_none());
    }
}
