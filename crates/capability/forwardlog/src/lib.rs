//! 转发日志汇聚器：有界队列、批量冲刷、线性退避重试。
//!
//! 生产者入队永不阻塞；队列满时丢最旧一条并计数。冲刷由三个条件触发：
//! 达到批量阈值、周期定时器、停止（先排空再退出）。

use async_trait::async_trait;
use domain::{now_epoch_ms, BusRequest, ForwardLogPayload, MessageType};
use gw_bus::{BusClient, BusError};
use gw_mapping::ForwardLogHandler;
use gw_telemetry::{record_forward_log_dropped, record_forward_log_sent};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 单条转发日志。`status`：1 成功，0 失败。
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub status: i32,
    pub north_device_name: String,
    pub data: Map<String, Value>,
    pub timestamp_ms: i64,
}

/// 日志发布出口；总线客户端是运行期实现，测试用桩替代。
#[async_trait]
pub trait ForwardPublisher: Send + Sync {
    async fn publish_forward_log(&self, entry: &LogEntry) -> Result<(), BusError>;
}

#[async_trait]
impl ForwardPublisher for BusClient {
    async fn publish_forward_log(&self, entry: &LogEntry) -> Result<(), BusError> {
        let payload = ForwardLogPayload {
            status: entry.status,
            north_device_name: entry.north_device_name.clone(),
            data: entry.data.clone(),
        };
        let request = BusRequest::new(MessageType::ForwardLog, serde_json::to_value(&payload)?);
        self.publish(&request).await
    }
}

/// 汇聚器配置。
#[derive(Debug, Clone)]
pub struct ForwardLogConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    /// 线性退避基数：第 n 次失败后睡 n 倍该时长。
    pub retry_backoff: Duration,
}

impl Default for ForwardLogConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            batch_size: 10,
            flush_interval: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

struct WorkerTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// 转发日志汇聚器。
pub struct ForwardLogSink {
    publisher: Arc<dyn ForwardPublisher>,
    config: ForwardLogConfig,
    queue: Mutex<VecDeque<LogEntry>>,
    dropped: AtomicU64,
    flush_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<WorkerTask>>,
}

impl ForwardLogSink {
    pub fn new(publisher: Arc<dyn ForwardPublisher>, config: ForwardLogConfig) -> Self {
        Self {
            publisher,
            config,
            queue: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            flush_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// 记录一次成功转发。
    pub fn log_success(&self, north_device_name: &str, data: Map<String, Value>) {
        self.push_entry(1, north_device_name, data);
    }

    /// 记录一次失败转发。
    pub fn log_failure(&self, north_device_name: &str, data: Map<String, Value>) {
        self.push_entry(0, north_device_name, data);
    }

    fn push_entry(&self, status: i32, north_device_name: &str, data: Map<String, Value>) {
        let entry = LogEntry {
            status,
            north_device_name: north_device_name.to_string(),
            data,
            timestamp_ms: now_epoch_ms(),
        };

        let should_flush = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(entry);
            if queue.len() > self.config.queue_capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                record_forward_log_dropped();
                warn!(target: "gw.forwardlog", "queue full, oldest entry dropped");
            }
            queue.len() >= self.config.batch_size
        };

        if should_flush {
            let nudge = {
                let slot = self.flush_tx.lock().unwrap_or_else(|e| e.into_inner());
                slot.clone()
            };
            if let Some(nudge) = nudge {
                let _ = nudge.try_send(());
            }
        }
    }

    /// 启动冲刷工作任务；重复启动是空操作。
    pub fn start(self: Arc<Self>) {
        let mut worker_slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker_slot.is_some() {
            return;
        }

        let (flush_tx, mut flush_rx) = mpsc::channel(1);
        {
            let mut slot = self.flush_tx.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(flush_tx);
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let sink = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sink.config.flush_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        sink.flush().await;
                        info!(target: "gw.forwardlog", "worker stopped");
                        break;
                    }
                    _ = ticker.tick() => sink.flush().await,
                    _ = flush_rx.recv() => sink.flush().await,
                }
            }
        });
        *worker_slot = Some(WorkerTask {
            stop: stop_tx,
            handle,
        });
        info!(target: "gw.forwardlog", "forward log sink started");
    }

    /// 停止并等待工作任务排空退出；重复停止是空操作。
    pub async fn stop(&self) {
        let task = {
            let mut slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        let Some(task) = task else {
            return;
        };
        {
            let mut slot = self.flush_tx.lock().unwrap_or_else(|e| e.into_inner());
            *slot = None;
        }
        let _ = task.stop.send(true);
        let _ = task.handle.await;
    }

    async fn flush(&self) {
        let entries: Vec<LogEntry> = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.drain(..).collect()
        };
        for entry in entries {
            self.send_entry(&entry).await;
        }
    }

    async fn send_entry(&self, entry: &LogEntry) {
        for attempt in 1..=self.config.max_retries {
            match self.publisher.publish_forward_log(entry).await {
                Ok(()) => {
                    record_forward_log_sent();
                    return;
                }
                Err(err) => {
                    warn!(
                        target: "gw.forwardlog",
                        attempt,
                        device = %entry.north_device_name,
                        "failed to send forward log: {}",
                        err
                    );
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    }
                }
            }
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        record_forward_log_dropped();
        error!(
            target: "gw.forwardlog",
            device = %entry.north_device_name,
            "forward log dropped after {} attempts",
            self.config.max_retries
        );
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ForwardLogHandler for ForwardLogSink {
    fn log_success(&self, north_device_name: &str, data: Map<String, Value>) {
        ForwardLogSink::log_success(self, north_device_name, data);
    }

    fn log_failure(&self, north_device_name: &str, data: Map<String, Value>) {
        ForwardLogSink::log_failure(self, north_device_name, data);
    }
}
