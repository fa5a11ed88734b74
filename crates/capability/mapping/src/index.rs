//! 设备映射索引：设备名与 Modbus 地址两张派生表。
//!
//! 属性更新时整体重建并在同一把写锁下换入，读者不会看到半成品。

use domain::{DeviceMapping, ResourceMapping};
use gw_telemetry::record_mapping_rebuild;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// 地址表条目：地址归属的设备与资源映射。
#[derive(Debug, Clone)]
pub struct AddressBinding {
    pub device_name: String,
    pub mapping: ResourceMapping,
}

/// 一次重建的统计。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildSummary {
    pub devices: usize,
    pub bound: usize,
    pub skipped: usize,
}

#[derive(Default)]
struct IndexState {
    devices: HashMap<String, DeviceMapping>,
    addresses: HashMap<u16, AddressBinding>,
}

/// 映射索引。
pub struct MappingIndex {
    state: RwLock<IndexState>,
}

impl MappingIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
        }
    }

    /// 以传入列表整体替换两张表。
    ///
    /// 缺失任一侧绑定的资源跳过；地址冲突先到先得，后到者跳过；
    /// 名称或类型不一致仅告警，不影响绑定。
    pub fn update_mappings(&self, mappings: Vec<DeviceMapping>) -> RebuildSummary {
        let mut devices = HashMap::new();
        let mut addresses: HashMap<u16, AddressBinding> = HashMap::new();
        let mut bound = 0usize;
        let mut skipped = 0usize;

        for device in mappings {
            for resource in &device.resources {
                let Some(north) = &resource.north_resource else {
                    warn!(
                        target: "gw.mapping",
                        device = %device.north_device_name,
                        "skipping resource: north binding missing"
                    );
                    skipped += 1;
                    continue;
                };
                let Some(south) = &resource.south_resource else {
                    warn!(
                        target: "gw.mapping",
                        device = %device.north_device_name,
                        resource = %north.name,
                        "skipping resource: south binding missing"
                    );
                    skipped += 1;
                    continue;
                };

                let address = north.modbus_address();
                if let Some(existing) = addresses.get(&address) {
                    let existing_resource = existing
                        .mapping
                        .north_resource
                        .as_ref()
                        .map(|r| r.name.as_str())
                        .unwrap_or_default();
                    warn!(
                        target: "gw.mapping",
                        address,
                        loser_device = %device.north_device_name,
                        loser_resource = %north.name,
                        winner_device = %existing.device_name,
                        winner_resource = %existing_resource,
                        "duplicate address, keeping first binding"
                    );
                    skipped += 1;
                    continue;
                }

                if north.name != south.name {
                    warn!(
                        target: "gw.mapping",
                        address,
                        north_name = %north.name,
                        south_name = %south.name,
                        "resource name mismatch, values matched by either name"
                    );
                }
                if north.value_type != south.value_type {
                    warn!(
                        target: "gw.mapping",
                        address,
                        resource = %north.name,
                        north_type = %north.value_type,
                        south_type = %south.value_type,
                        "value type mismatch between sides"
                    );
                }

                addresses.insert(
                    address,
                    AddressBinding {
                        device_name: device.north_device_name.clone(),
                        mapping: resource.clone(),
                    },
                );
                debug!(
                    target: "gw.mapping",
                    address,
                    device = %device.north_device_name,
                    resource = %north.name,
                    "address bound"
                );
                bound += 1;
            }
            devices.insert(device.north_device_name.clone(), device);
        }

        let summary = RebuildSummary {
            devices: devices.len(),
            bound,
            skipped,
        };
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.devices = devices;
            state.addresses = addresses;
        }
        record_mapping_rebuild();
        info!(
            target: "gw.mapping",
            devices = summary.devices,
            bound = summary.bound,
            skipped = summary.skipped,
            "mappings rebuilt"
        );
        summary
    }

    pub fn mapping_by_address(&self, address: u16) -> Option<AddressBinding> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.addresses.get(&address).cloned()
    }

    pub fn device_mapping(&self, north_device_name: &str) -> Option<DeviceMapping> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.devices.get(north_device_name).cloned()
    }

    pub fn address_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.addresses.len()
    }

    pub fn device_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.devices.len()
    }
}

impl Default for MappingIndex {
    fn default() -> Self {
        Self::new()
    }
}
