//! TTL 寄存器镜像缓存。
//!
//! 过期条目对读者与不存在无差别；删除只发生在清理扫描里。

use domain::{ResourceValue, ValueType};
use gw_telemetry::record_cache_evictions;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// 缓存条目：值连同其映射在写入时刻的类型与标定参数。
#[derive(Debug, Clone)]
pub struct CachedData {
    pub value: ResourceValue,
    pub stamped: Instant,
    pub ttl: Duration,
    pub north_device_name: String,
    pub resource_name: String,
    pub value_type: ValueType,
    pub scale: f64,
    pub offset: f64,
    pub address: u16,
}

impl CachedData {
    pub fn is_expired(&self) -> bool {
        self.stamped.elapsed() > self.ttl
    }
}

struct SweepTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// 按 Modbus 地址索引的寄存器缓存。
pub struct RegisterCache {
    data: RwLock<HashMap<u16, CachedData>>,
    default_ttl: Duration,
    sweeper: Mutex<Option<SweepTask>>,
}

impl RegisterCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            default_ttl,
            sweeper: Mutex::new(None),
        }
    }

    /// 写入并覆盖旧值。零 TTL 以缓存默认值替代；写入时刻重新打戳。
    pub fn set(&self, address: u16, mut datum: CachedData) {
        if datum.ttl.is_zero() {
            datum.ttl = self.default_ttl;
        }
        datum.stamped = Instant::now();
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.insert(address, datum);
    }

    /// 读取存活条目；过期条目视同不存在，读取不做删除。
    pub fn get(&self, address: u16) -> Option<CachedData> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(&address)
            .filter(|datum| !datum.is_expired())
            .cloned()
    }

    /// 连续地址段的稠密读取，空洞以 None 占位。地址按 16 位回绕行走。
    pub fn get_range(&self, start: u16, quantity: u16) -> Vec<Option<CachedData>> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        (0..quantity)
            .map(|i| {
                data.get(&start.wrapping_add(i))
                    .filter(|datum| !datum.is_expired())
                    .cloned()
            })
            .collect()
    }

    /// 删除全部过期条目，返回删除数。
    pub fn cleanup(&self) -> usize {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let before = data.len();
        data.retain(|_, datum| !datum.is_expired());
        let removed = before - data.len();
        if removed > 0 {
            record_cache_evictions(removed as u64);
        }
        removed
    }

    pub fn clear(&self) {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.clear();
    }

    pub fn len(&self) -> usize {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 启动周期清理扫描；仅当清理数非零时触发回调。重复调用先停旧任务。
    pub fn start_sweep(
        self: Arc<Self>,
        interval: Duration,
        callback: impl Fn(usize) + Send + Sync + 'static,
    ) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let cache = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // interval 的首个 tick 立即返回，清理从一个完整周期之后开始。
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.cleanup();
                        if removed > 0 {
                            callback(removed);
                        }
                    }
                    _ = stop_rx.changed() => {
                        info!(target: "gw.mapping", "cache sweep stopped");
                        break;
                    }
                }
            }
        });

        let previous = {
            let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
            slot.replace(SweepTask {
                stop: stop_tx,
                handle,
            })
        };
        if let Some(previous) = previous {
            let _ = previous.stop.send(true);
            previous.handle.abort();
        }
    }

    /// 停止清理任务并等待退出。
    pub async fn stop_sweep(&self) {
        let task = {
            let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(task) = task {
            let _ = task.stop.send(true);
            let _ = task.handle.await;
        }
    }
}
