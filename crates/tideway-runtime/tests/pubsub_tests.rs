//! Topic broker behaviour seen through the public API.

use std::sync::Arc;
use std::time::Duration;

use tideway_core::{Tuple, Value};
use tideway_runtime::pubsub::{Payload, TopicBroker};
use tideway_runtime::StreamContext;
use tokio::sync::mpsc;

fn tuple(n: i64) -> Tuple {
    Tuple::new("test").with_field("n", n)
}

fn field(payload: &Payload) -> Option<Value> {
    match payload {
        Payload::Tuple(t) => t.get("n").cloned(),
        _ => None,
    }
}

async fn recv(rx: &mut mpsc::Receiver<Payload>) -> Payload {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

// =============================================================================
// Fan-out
// =============================================================================

#[tokio::test]
async fn test_every_consumer_receives() {
    let broker = TopicBroker::new();
    let ctx = StreamContext::new("rule1", "sink", 0);
    broker.create_pub("sensors/temp");
    let mut a = broker.create_sub("sensors/temp", false, "a", 8).unwrap();
    let mut b = broker.create_sub("sensors/temp", false, "b", 8).unwrap();
    let mut w = broker.create_sub("sensors/#", true, "w", 8).unwrap();

    broker.produce(&ctx, "sensors/temp", tuple(1));

    for rx in [&mut a, &mut b, &mut w] {
        assert_eq!(field(&recv(rx).await), Some(Value::Int(1)));
    }
    assert_eq!(broker.stats().delivered, 3);
}

#[tokio::test]
async fn test_produce_without_topic_is_noop() {
    let broker = TopicBroker::new();
    broker.produce(&StreamContext::background(), "nobody", tuple(1));
    assert_eq!(broker.stats().delivered, 0);
    assert!(!broker.has_topic("nobody"));
}

#[tokio::test]
async fn test_full_consumer_does_not_block_others() {
    let broker = TopicBroker::new();
    let ctx = StreamContext::background();
    broker.create_pub("t");
    let _slow = broker.create_sub("t", false, "slow", 1).unwrap();
    let mut fast = broker.create_sub("t", false, "fast", 16).unwrap();

    for n in 0..4 {
        broker.produce(&ctx, "t", tuple(n));
    }
    for n in 0..4 {
        assert_eq!(field(&recv(&mut fast).await), Some(Value::Int(n)));
    }
    assert_eq!(broker.stats().dropped, 3);
}

// =============================================================================
// Wildcards
// =============================================================================

#[tokio::test]
async fn test_wildcard_follows_new_topics() {
    let broker = TopicBroker::new();
    let ctx = StreamContext::background();
    let mut rx = broker.create_sub("home/+/temp", true, "w", 8).unwrap();

    broker.create_pub("home/kitchen/temp");
    broker.create_pub("home/kitchen/humidity");
    broker.produce(&ctx, "home/kitchen/humidity", tuple(0));
    broker.produce(&ctx, "home/kitchen/temp", tuple(1));
    assert_eq!(field(&recv(&mut rx).await), Some(Value::Int(1)));

    broker.close_source_consumer_channel("home/+/temp", "w");
    assert_eq!(broker.consumer_count("home/kitchen/temp"), 0);
}

#[test]
fn test_invalid_patterns_rejected() {
    let broker = TopicBroker::new();
    assert!(broker.create_sub("a/#/b", true, "c", 1).is_err());
    assert!(broker.create_sub("a/b+", true, "c", 1).is_err());
    assert!(broker.create_sub("", false, "c", 1).is_err());
}

// =============================================================================
// Rule restart
// =============================================================================

#[tokio::test]
async fn test_late_close_keeps_replacement() {
    let broker = TopicBroker::new();
    let ctx = StreamContext::background();
    broker.create_pub("t");

    let _old = broker.create_sub("t", false, "rule1_src_0", 8).unwrap();
    let mut new = broker.create_sub("t", false, "rule1_src_0", 8).unwrap();
    // the old instance's close arrives after the replacement subscribed
    broker.close_source_consumer_channel("t", "rule1_src_0");

    broker.produce(&ctx, "t", tuple(7));
    assert_eq!(field(&recv(&mut new).await), Some(Value::Int(7)));

    broker.close_source_consumer_channel("t", "rule1_src_0");
    assert_eq!(broker.consumer_count("t"), 0);
}

#[tokio::test]
async fn test_late_wildcard_close_keeps_replacement() {
    let broker = TopicBroker::new();
    let ctx = StreamContext::background();
    broker.create_pub("a/b");

    let _old = broker.create_sub("a/#", true, "w", 8).unwrap();
    let mut new = broker.create_sub("a/#", true, "w", 8).unwrap();
    broker.close_source_consumer_channel("a/#", "w");

    broker.produce(&ctx, "a/b", tuple(3));
    assert_eq!(field(&recv(&mut new).await), Some(Value::Int(3)));
}

#[tokio::test]
async fn test_topic_removed_when_unused() {
    let broker = TopicBroker::new();
    broker.create_pub("t");
    broker.create_pub("t");
    let _rx = broker.create_sub("t", false, "c", 1).unwrap();

    broker.remove_pub("t");
    broker.remove_pub("t");
    assert!(broker.has_topic("t"));
    broker.close_source_consumer_channel("t", "c");
    assert!(!broker.has_topic("t"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_restarts_leave_no_consumer() {
    let broker = Arc::new(TopicBroker::new());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..200 {
                let _rx = broker.create_sub("restart", false, "rule1_src_0", 4).unwrap();
                tokio::task::yield_now().await;
                broker.close_source_consumer_channel("restart", "rule1_src_0");
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(broker.consumer_count("restart"), 0);
    assert!(!broker.has_topic("restart"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_wildcard_restarts_leave_no_consumer() {
    let broker = Arc::new(TopicBroker::new());
    broker.create_pub("plant/line1");
    let mut handles = Vec::new();
    for _ in 0..8 {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..200 {
                let _rx = broker.create_sub("plant/#", true, "w", 4).unwrap();
                tokio::task::yield_now().await;
                broker.close_source_consumer_channel("plant/#", "w");
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(broker.consumer_count("plant/line1"), 0);

    // a fresh subscriber is not shadowed by leftover replacement counts
    let mut rx = broker.create_sub("plant/#", true, "w", 4).unwrap();
    broker.produce(&StreamContext::background(), "plant/line1", tuple(9));
    assert_eq!(field(&recv(&mut rx).await), Some(Value::Int(9)));
    broker.close_source_consumer_channel("plant/#", "w");
    assert_eq!(broker.consumer_count("plant/line1"), 0);
}
