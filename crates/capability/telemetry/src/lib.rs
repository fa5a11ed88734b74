//! 追踪初始化、运行期日志级别与进程内计数。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

/// 运行期日志级别句柄。配置中的 LogLevel 是可变旋钮，通过它热更新过滤器。
#[derive(Clone)]
pub struct LogLevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelHandle {
    /// 替换当前日志过滤指令（如 "info"、"gw_bus=debug"）。非法指令保留旧配置。
    pub fn set(&self, directive: &str) -> bool {
        match EnvFilter::try_new(directive) {
            Ok(filter) => self.handle.reload(filter).is_ok(),
            Err(_) => false,
        }
    }
}

/// 初始化 tracing，环境变量优先于传入级别。
pub fn init_tracing(level: &str) -> LogLevelHandle {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")));
    let (filter, handle) = reload::Layer::new(filter);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
    LogLevelHandle { handle }
}

/// 基础指标快照。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub bus_messages_in: u64,
    pub bus_messages_out: u64,
    pub bus_decode_errors: u64,
    pub pending_timeouts: u64,
    pub heartbeats_sent: u64,
    pub telemetry_updates: u64,
    pub mapping_rebuilds: u64,
    pub cache_evictions: u64,
    pub modbus_requests: u64,
    pub modbus_exceptions: u64,
    pub forward_logs_sent: u64,
    pub forward_logs_dropped: u64,
}

/// 基础指标。
pub struct GatewayMetrics {
    bus_messages_in: AtomicU64,
    bus_messages_out: AtomicU64,
    bus_decode_errors: AtomicU64,
    pending_timeouts: AtomicU64,
    heartbeats_sent: AtomicU64,
    telemetry_updates: AtomicU64,
    mapping_rebuilds: AtomicU64,
    cache_evictions: AtomicU64,
    modbus_requests: AtomicU64,
    modbus_exceptions: AtomicU64,
    forward_logs_sent: AtomicU64,
    forward_logs_dropped: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            bus_messages_in: AtomicU64::new(0),
            bus_messages_out: AtomicU64::new(0),
            bus_decode_errors: AtomicU64::new(0),
            pending_timeouts: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            telemetry_updates: AtomicU64::new(0),
            mapping_rebuilds: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
            modbus_requests: AtomicU64::new(0),
            modbus_exceptions: AtomicU64::new(0),
            forward_logs_sent: AtomicU64::new(0),
            forward_logs_dropped: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bus_messages_in: self.bus_messages_in.load(Ordering::Relaxed),
            bus_messages_out: self.bus_messages_out.load(Ordering::Relaxed),
            bus_decode_errors: self.bus_decode_errors.load(Ordering::Relaxed),
            pending_timeouts: self.pending_timeouts.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            telemetry_updates: self.telemetry_updates.load(Ordering::Relaxed),
            mapping_rebuilds: self.mapping_rebuilds.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            modbus_requests: self.modbus_requests.load(Ordering::Relaxed),
            modbus_exceptions: self.modbus_exceptions.load(Ordering::Relaxed),
            forward_logs_sent: self.forward_logs_sent.load(Ordering::Relaxed),
            forward_logs_dropped: self.forward_logs_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<GatewayMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static GatewayMetrics {
    METRICS.get_or_init(GatewayMetrics::new)
}

/// 记录总线入站报文。
pub fn record_bus_message_in() {
    metrics().bus_messages_in.fetch_add(1, Ordering::Relaxed);
}

/// 记录总线出站报文。
pub fn record_bus_message_out() {
    metrics().bus_messages_out.fetch_add(1, Ordering::Relaxed);
}

/// 记录入站报文解码失败。
pub fn record_bus_decode_error() {
    metrics().bus_decode_errors.fetch_add(1, Ordering::Relaxed);
}

/// 记录等待应答超时。
pub fn record_pending_timeout() {
    metrics().pending_timeouts.fetch_add(1, Ordering::Relaxed);
}

/// 记录心跳发送成功。
pub fn record_heartbeat_sent() {
    metrics().heartbeats_sent.fetch_add(1, Ordering::Relaxed);
}

/// 记录遥测入缓存。
pub fn record_telemetry_update() {
    metrics().telemetry_updates.fetch_add(1, Ordering::Relaxed);
}

/// 记录映射表整体重建。
pub fn record_mapping_rebuild() {
    metrics().mapping_rebuilds.fetch_add(1, Ordering::Relaxed);
}

/// 记录缓存过期清除条数。
pub fn record_cache_evictions(count: u64) {
    metrics().cache_evictions.fetch_add(count, Ordering::Relaxed);
}

/// 记录处理的 Modbus 请求。
pub fn record_modbus_request() {
    metrics().modbus_requests.fetch_add(1, Ordering::Relaxed);
}

/// 记录返回异常码的 Modbus 请求。
pub fn record_modbus_exception() {
    metrics().modbus_exceptions.fetch_add(1, Ordering::Relaxed);
}

/// 记录转发日志发布成功。
pub fn record_forward_log_sent() {
    metrics().forward_logs_sent.fetch_add(1, Ordering::Relaxed);
}

/// 记录转发日志被丢弃（重试耗尽或队列溢出）。
pub fn record_forward_log_dropped() {
    metrics().forward_logs_dropped.fetch_add(1, Ordering::Relaxed);
}
