//! 映射服务：索引、缓存与转发日志出口的组合门面。

use crate::cache::{CachedData, RegisterCache};
use crate::index::{AddressBinding, MappingIndex, RebuildSummary};
use domain::{
    BusRequest, DeviceMapping, DomainError, MessageType, QueryDevicesRequest, ResourceValue,
};
use gw_bus::{BusClient, BusError};
use gw_telemetry::record_telemetry_update;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 成功读取路径的转发日志出口。由日志汇聚器实现。
pub trait ForwardLogHandler: Send + Sync {
    fn log_success(&self, north_device_name: &str, data: Map<String, Value>);
    fn log_failure(&self, north_device_name: &str, data: Map<String, Value>);
}

/// 映射层错误。
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("unknown north device: {0}")]
    UnknownDevice(String),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("payload error: {0}")]
    Payload(#[from] DomainError),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("device query returned code {code}: {msg}")]
    QueryRejected { code: i32, msg: String },
}

/// 映射服务。
pub struct MappingService {
    index: MappingIndex,
    cache: Arc<RegisterCache>,
    forward: RwLock<Option<Arc<dyn ForwardLogHandler>>>,
}

impl MappingService {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            index: MappingIndex::new(),
            cache: Arc::new(RegisterCache::new(default_ttl)),
            forward: RwLock::new(None),
        }
    }

    /// 挂接转发日志出口（可选，晚于构造）。
    pub fn set_forward_log_handler(&self, handler: Arc<dyn ForwardLogHandler>) {
        let mut slot = self.forward.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handler);
    }

    pub fn index(&self) -> &MappingIndex {
        &self.index
    }

    pub fn mapping_by_address(&self, address: u16) -> Option<AddressBinding> {
        self.index.mapping_by_address(address)
    }

    pub fn device_mapping(&self, north_device_name: &str) -> Option<DeviceMapping> {
        self.index.device_mapping(north_device_name)
    }

    pub fn cached_value(&self, address: u16) -> Option<CachedData> {
        self.cache.get(address)
    }

    pub fn cached_range(&self, start: u16, quantity: u16) -> Vec<Option<CachedData>> {
        self.cache.get_range(start, quantity)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// 启动时向数据中心查询设备属性并重建映射。
    pub async fn query_device_attributes(
        &self,
        bus: &BusClient,
        timeout: Duration,
    ) -> Result<RebuildSummary, MappingError> {
        info!(target: "gw.mapping", "querying device attributes");
        let request = BusRequest::new(
            MessageType::QueryDevices,
            serde_json::to_value(QueryDevicesRequest::attributes())?,
        );
        let response = bus.publish_and_wait(&request, timeout).await?;
        if response.code != 200 {
            return Err(MappingError::QueryRejected {
                code: response.code,
                msg: response.msg,
            });
        }
        let payload = response.query_devices_payload()?;
        info!(
            target: "gw.mapping",
            devices = payload.result.len(),
            "device attributes received"
        );
        Ok(self.update_mappings(payload.result))
    }

    pub fn update_mappings(&self, mappings: Vec<DeviceMapping>) -> RebuildSummary {
        self.index.update_mappings(mappings)
    }

    /// type=3 属性下发入口。
    pub fn handle_attribute_push(&self, request: &BusRequest) -> Result<RebuildSummary, MappingError> {
        let payload = request.attribute_push_payload()?;
        info!(
            target: "gw.mapping",
            devices = payload.devices.len(),
            "device attribute update received"
        );
        Ok(self.update_mappings(payload.devices))
    }

    /// type=4 遥测入口：只更新缓存，转发日志等到北向真正读取时记。
    pub fn handle_telemetry(&self, request: &BusRequest) -> Result<usize, MappingError> {
        let payload = request.telemetry_payload()?;
        debug!(
            target: "gw.mapping",
            device = %payload.north_device_name,
            keys = payload.data.len(),
            "telemetry received"
        );
        self.update_cache(&payload.north_device_name, &payload.data)
    }

    /// 将一帧遥测写入缓存：值先按南向名查找，再按北向名兜底；
    /// 找不到或无法按声明类型收敛的值静默跳过。
    pub fn update_cache(
        &self,
        north_device_name: &str,
        data: &Map<String, Value>,
    ) -> Result<usize, MappingError> {
        let Some(device) = self.index.device_mapping(north_device_name) else {
            return Err(MappingError::UnknownDevice(north_device_name.to_string()));
        };

        let mut updated = 0usize;
        for resource in &device.resources {
            let (Some(north), Some(south)) = (&resource.north_resource, &resource.south_resource)
            else {
                continue;
            };

            let Some(raw) = data.get(&south.name).or_else(|| data.get(&north.name)) else {
                debug!(
                    target: "gw.mapping",
                    south_name = %south.name,
                    north_name = %north.name,
                    "no telemetry value for resource"
                );
                continue;
            };
            let Some(value) =
                ResourceValue::from_json(raw).and_then(|value| value.coerce(north.value_type))
            else {
                debug!(
                    target: "gw.mapping",
                    resource = %north.name,
                    value_type = %north.value_type,
                    "telemetry value not representable, skipped"
                );
                continue;
            };

            let address = north.modbus_address();
            self.cache.set(
                address,
                CachedData {
                    value,
                    stamped: Instant::now(),
                    ttl: Duration::ZERO,
                    north_device_name: device.north_device_name.clone(),
                    resource_name: north.name.clone(),
                    value_type: north.value_type,
                    scale: north.scale,
                    offset: north.offset_value,
                    address,
                },
            );
            updated += 1;
        }

        record_telemetry_update();
        debug!(
            target: "gw.mapping",
            device = %north_device_name,
            updated,
            "cache updated"
        );
        Ok(updated)
    }

    /// 北向读取成功后，把按设备分组的数据交给转发日志出口。
    pub fn log_data_forward(&self, grouped: HashMap<String, Map<String, Value>>) {
        if grouped.is_empty() {
            return;
        }
        let handler = {
            let slot = self.forward.read().unwrap_or_else(|e| e.into_inner());
            slot.clone()
        };
        let Some(handler) = handler else {
            return;
        };
        for (device, data) in grouped {
            if !data.is_empty() {
                handler.log_success(&device, data);
            }
        }
    }

    /// 启动缓存周期清理。
    pub fn start_sweep(&self, interval: Duration) {
        Arc::clone(&self.cache).start_sweep(interval, |removed| {
            debug!(target: "gw.mapping", removed, "cache sweep removed expired entries");
        });
        info!(target: "gw.mapping", interval_ms = interval.as_millis() as u64, "cache sweep started");
    }

    /// 停止后台任务。
    pub async fn stop(&self) {
        self.cache.stop_sweep().await;
    }
}
