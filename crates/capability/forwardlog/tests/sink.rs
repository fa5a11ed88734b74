use async_trait::async_trait;
use gw_bus::BusError;
use gw_forwardlog::{ForwardLogConfig, ForwardLogSink, ForwardPublisher, LogEntry};
use serde_json::{json, Map};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockPublisher {
    published: Mutex<Vec<LogEntry>>,
    fail: AtomicBool,
    attempts: AtomicUsize,
}

#[async_trait]
impl ForwardPublisher for MockPublisher {
    async fn publish_forward_log(&self, entry: &LogEntry) -> Result<(), BusError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(BusError::Publish("broker offline".to_string()));
        }
        self.published.lock().expect("lock").push(entry.clone());
        Ok(())
    }
}

fn fast_config() -> ForwardLogConfig {
    ForwardLogConfig {
        queue_capacity: 100,
        batch_size: 3,
        flush_interval: Duration::from_millis(50),
        max_retries: 3,
        retry_backoff: Duration::from_millis(5),
    }
}

fn data(value: i64) -> Map<String, serde_json::Value> {
    let mut map = Map::new();
    map.insert("point".to_string(), json!(value));
    map
}

#[tokio::test]
async fn batch_threshold_triggers_flush() {
    let publisher = Arc::new(MockPublisher::default());
    let sink = Arc::new(ForwardLogSink::new(publisher.clone(), fast_config()));
    sink.clone().start();

    for i in 0..3 {
        sink.log_success("device1", data(i));
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(publisher.published.lock().expect("lock").len(), 3);
    assert_eq!(sink.queue_len(), 0);
    sink.stop().await;
}

#[tokio::test]
async fn timer_flushes_partial_batch() {
    let publisher = Arc::new(MockPublisher::default());
    let sink = Arc::new(ForwardLogSink::new(publisher.clone(), fast_config()));
    sink.clone().start();

    sink.log_success("device1", data(1));
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(publisher.published.lock().expect("lock").len(), 1);
    sink.stop().await;
}

#[tokio::test]
async fn stop_drains_queue() {
    let publisher = Arc::new(MockPublisher::default());
    let sink = Arc::new(ForwardLogSink::new(
        publisher.clone(),
        ForwardLogConfig {
            batch_size: 100,
            flush_interval: Duration::from_secs(60),
            ..fast_config()
        },
    ));
    sink.clone().start();

    sink.log_failure("device1", data(1));
    sink.log_success("device2", data(2));
    sink.stop().await;

    let published = publisher.published.lock().expect("lock");
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].status, 0);
    assert_eq!(published[1].status, 1);
    assert_eq!(sink.queue_len(), 0);
}

#[tokio::test]
async fn exhausted_retries_drop_the_entry() {
    let publisher = Arc::new(MockPublisher::default());
    publisher.fail.store(true, Ordering::SeqCst);
    let sink = Arc::new(ForwardLogSink::new(publisher.clone(), fast_config()));
    sink.clone().start();

    sink.log_success("device1", data(1));
    sink.stop().await;

    assert_eq!(publisher.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(sink.dropped_count(), 1);
}

#[tokio::test]
async fn bounded_queue_drops_oldest() {
    let publisher = Arc::new(MockPublisher::default());
    // 不启动工作任务，让条目滞留在队列里。
    let sink = Arc::new(ForwardLogSink::new(
        publisher.clone(),
        ForwardLogConfig {
            queue_capacity: 2,
            batch_size: 100,
            ..fast_config()
        },
    ));

    for i in 0..4 {
        sink.log_success("device1", data(i));
    }

    assert_eq!(sink.queue_len(), 2);
    assert_eq!(sink.dropped_count(), 2);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let publisher = Arc::new(MockPublisher::default());
    let sink = Arc::new(ForwardLogSink::new(publisher.clone(), fast_config()));
    sink.clone().start();
    sink.clone().start();
    sink.stop().await;
    sink.stop().await;
}
