//! Queue behaviour against a real Redis server.
//!
//! Run with `cargo test -p stream-queue -- --ignored` (requires Docker).

use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use stream_queue::{
    GroupCreation, Message, Payload, RedisStreamStore, StreamConfig, StreamConsumer, StreamError,
    StreamQueueManager, StreamStore, handler_fn,
};
use test_utils::{TestRedis, unique_name};

fn payload(id: u64) -> Payload {
    let mut payload = Payload::new();
    payload.insert("event_id".into(), json!(id));
    payload.insert("kind".into(), json!("signup"));
    payload
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_group_creation_is_idempotent() {
    let redis = TestRedis::new().await;
    let store = RedisStreamStore::new(redis.client(), redis.connection_manager().await);
    let stream = unique_name("events");

    assert_eq!(
        store.create_group(&stream, "workers").await.unwrap(),
        GroupCreation::Created
    );
    assert_eq!(
        store.create_group(&stream, "workers").await.unwrap(),
        GroupCreation::AlreadyExists
    );
    assert_eq!(store.len(&stream).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_store_consumer_group_semantics() {
    let redis = TestRedis::new().await;
    let store = RedisStreamStore::new(redis.client(), redis.connection_manager().await);
    let stream = unique_name("events");
    store.create_group(&stream, "workers").await.unwrap();

    let fields = vec![("k".to_string(), "\"v\"".to_string())];
    let first = store.append(&stream, &fields, Some(100)).await.unwrap();
    store.append(&stream, &fields, Some(100)).await.unwrap();

    let delivered = store
        .read_group(&stream, "workers", "a", 1, Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, first);

    let pending = store.pending(&stream, "workers", "a", 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].deliveries, 1);

    let summary = store.pending_summary(&stream, "workers").await.unwrap();
    assert_eq!(summary.count, 1);
    assert_eq!(summary.consumers, 1);

    let claimed = store
        .claim(&stream, "workers", "b", Duration::ZERO, &[first.clone()])
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    store.ack(&stream, "workers", &first).await.unwrap();
    assert_eq!(store.pending_summary(&stream, "workers").await.unwrap().count, 0);

    let page = store.range(&stream, Some(&first), 10).await.unwrap();
    assert_eq!(page.len(), 1);
    assert!(store.get(&stream, &first).await.unwrap().is_some());

    assert_eq!(store.delete(&stream, &[first.clone()]).await.unwrap(), 1);
    assert!(store.get(&stream, &first).await.unwrap().is_none());
    assert_eq!(store.trim(&stream, 0).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_empty_blocking_read_returns_nothing() {
    let redis = TestRedis::new().await;
    let store = RedisStreamStore::new(redis.client(), redis.connection_manager().await);
    let stream = unique_name("events");
    store.create_group(&stream, "workers").await.unwrap();

    let entries = store
        .read_group(&stream, "workers", "a", 10, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_missing_group_is_reported_as_nogroup() {
    let redis = TestRedis::new().await;
    let store = RedisStreamStore::new(redis.client(), redis.connection_manager().await);

    let err = store
        .read_group(&unique_name("events"), "workers", "a", 10, None)
        .await
        .unwrap_err();
    assert!(err.is_nogroup());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_retry_then_dead_letter_over_redis() {
    let redis = TestRedis::new().await;
    let store = Arc::new(RedisStreamStore::new(redis.client(), redis.connection_manager().await));
    let queue = StreamQueueManager::new(store.clone());
    let stream = unique_name("events");

    let calls = Arc::new(AtomicU32::new(0));
    let handler: Arc<dyn stream_queue::MessageHandler> = {
        let calls = calls.clone();
        Arc::new(handler_fn("always_fails", move |_msg: Message| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StreamError::handler("smtp unavailable"))
            }
        }))
    };

    let config = queue
        .register_stream_arc(
            StreamConfig::new(&stream, "workers")
                .with_consumer_name("worker-1")
                .with_max_retries(2)
                .with_retry_delay(Duration::from_millis(1))
                .with_block_duration(Duration::from_millis(50)),
            handler.clone(),
        )
        .await
        .unwrap();
    let consumer = StreamConsumer::new(store.clone(), config, handler);

    queue.publish(&stream, &payload(1)).await.unwrap();

    for _ in 0..5 {
        consumer.consume_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        consumer.promote_delayed().await.unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let letters = queue
        .dead_letters(&stream)
        .unwrap()
        .list(10, None)
        .await
        .unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(letters[0].error.as_deref(), Some("smtp unavailable"));
    assert_eq!(letters[0].data.get("event_id"), Some(&json!(1)));

    let stats = queue.get_stats().await;
    assert_eq!(stats[&stream].pending_messages, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_delayed_publish_over_redis() {
    let redis = TestRedis::new().await;
    let store = Arc::new(RedisStreamStore::new(redis.client(), redis.connection_manager().await));
    let queue = StreamQueueManager::new(store.clone());
    let stream = unique_name("events");

    let handler: Arc<dyn stream_queue::MessageHandler> =
        Arc::new(handler_fn("noop", |_msg| async { Ok(()) }));
    let config = queue
        .register_stream_arc(
            StreamConfig::new(&stream, "workers").with_block_duration(Duration::from_millis(50)),
            handler.clone(),
        )
        .await
        .unwrap();
    let consumer = StreamConsumer::new(store.clone(), config, handler);

    queue
        .publish_delayed(&stream, &payload(2), Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(consumer.promote_delayed().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(consumer.promote_delayed().await.unwrap(), 1);
    assert_eq!(consumer.consume_once().await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_running_consumer_does_not_stall_shared_connection() {
    let redis = TestRedis::new().await;
    let store = Arc::new(RedisStreamStore::new(redis.client(), redis.connection_manager().await));
    let queue = StreamQueueManager::new(store.clone());
    let stream = unique_name("events");

    let calls = Arc::new(AtomicU32::new(0));
    let handler = {
        let calls = calls.clone();
        handler_fn("count", move |_msg: Message| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };
    queue
        .register_stream(
            StreamConfig::new(&stream, "workers").with_block_duration(Duration::from_secs(5)),
            handler,
        )
        .await
        .unwrap();
    queue.start_all_consumers().unwrap();

    // Let the consumer park in XREADGROUP BLOCK
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.reader_count(), 1);

    let mut conn = store.connection();
    for _ in 0..5 {
        let pong: String = tokio::time::timeout(
            Duration::from_millis(400),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .expect("PING stalled behind the blocking read")
        .unwrap();
        assert_eq!(pong, "PONG");
        assert_eq!(store.len(&stream).await.unwrap(), 0);
    }

    for n in 0..10 {
        tokio::time::timeout(Duration::from_millis(400), queue.publish(&stream, &payload(n)))
            .await
            .expect("publish stalled behind the blocking read")
            .unwrap();
    }

    for _ in 0..100 {
        if calls.load(Ordering::SeqCst) == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 10);
    assert_eq!(store.reader_count(), 1);

    queue.stop().await;
}
