//! 从寄存器缓存装配读响应。
//!
//! 字级行走：地址上有值则按类型宽度消费输出字并同步前进；无值补一个零字。
//! 若类型宽度超出请求剩余字数，输出截断、余下补零。

use crate::convert::ValueConverter;
use crate::error::ModbusError;
use gw_mapping::MappingService;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// 一次读取的结果：响应数据（字节数前缀 + 寄存器字节）与按设备分组的转发数据。
#[derive(Debug)]
pub struct ReadOutcome {
    pub data: Vec<u8>,
    pub forwarded: HashMap<String, Map<String, Value>>,
}

/// 寄存器读取器。
pub struct RegisterReader {
    mappings: Arc<MappingService>,
    converter: ValueConverter,
}

impl RegisterReader {
    pub fn new(mappings: Arc<MappingService>, converter: ValueConverter) -> Self {
        Self {
            mappings,
            converter,
        }
    }

    /// 字寄存器读取（功能码 0x03/0x04 共用）。
    pub fn read_registers(&self, start: u16, quantity: u16) -> Result<ReadOutcome, ModbusError> {
        let mut data = vec![0u8; 1 + quantity as usize * 2];
        data[0] = (quantity as usize * 2) as u8;
        let mut forwarded: HashMap<String, Map<String, Value>> = HashMap::new();

        let mut offset = 1usize;
        let mut current = 0u16;
        while current < quantity {
            let address = start.wrapping_add(current);
            let Some(datum) = self.mappings.cached_value(address) else {
                // 无缓存数据：补一个零字。
                offset += 2;
                current += 1;
                continue;
            };

            let bytes = match self.converter.to_registers(
                &datum.value,
                datum.value_type,
                datum.scale,
                datum.offset,
            ) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(target: "gw.modbus", address, "value conversion failed: {}", err);
                    offset += 2;
                    current += 1;
                    continue;
                }
            };

            let width = datum.value_type.register_count();
            let take = width.min(quantity - current);
            let take_bytes = take as usize * 2;
            if bytes.len() >= take_bytes {
                data[offset..offset + take_bytes].copy_from_slice(&bytes[..take_bytes]);
                forwarded
                    .entry(datum.north_device_name.clone())
                    .or_default()
                    .insert(datum.resource_name.clone(), datum.value.to_json());
            }
            offset += take_bytes;
            current += take;
        }

        Ok(ReadOutcome { data, forwarded })
    }

    /// 位读取（功能码 0x01/0x02 共用）：真值按位打包，缺失位为 0。
    pub fn read_bits(&self, start: u16, quantity: u16) -> Result<ReadOutcome, ModbusError> {
        let byte_count = quantity.div_ceil(8) as usize;
        let mut data = vec![0u8; 1 + byte_count];
        data[0] = byte_count as u8;
        let mut forwarded: HashMap<String, Map<String, Value>> = HashMap::new();

        for i in 0..quantity {
            let address = start.wrapping_add(i);
            let Some(datum) = self.mappings.cached_value(address) else {
                continue;
            };
            forwarded
                .entry(datum.north_device_name.clone())
                .or_default()
                .insert(datum.resource_name.clone(), datum.value.to_json());
            if datum.value.truthy() {
                data[1 + (i / 8) as usize] |= 1u8 << (i % 8);
            }
        }

        Ok(ReadOutcome { data, forwarded })
    }
}
