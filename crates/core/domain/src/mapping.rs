//! 设备与资源映射模型。
//!
//! 北向资源是对外可见的 Modbus 点位，南向资源是设备侧遥测点位；
//! 一条资源映射把两者绑在一起，地址挂在北向侧。

use crate::value::ValueType;
use serde::{Deserialize, Deserializer, Serialize};

/// 设备级映射，按北向设备名索引。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMapping {
    pub north_device_name: String,
    #[serde(default)]
    pub resources: Vec<ResourceMapping>,
}

/// 北向/南向资源绑定。任一侧缺失的条目在重建索引时跳过。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMapping {
    #[serde(default)]
    pub north_resource: Option<NorthResource>,
    #[serde(default)]
    pub south_resource: Option<SouthResource>,
}

/// 北向资源：对外暴露的点位定义。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NorthResource {
    pub name: String,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub scale: f64,
    #[serde(default)]
    pub offset_value: f64,
    #[serde(default)]
    pub other_parameters: OtherParameters,
}

impl NorthResource {
    /// 北向侧挂载的 Modbus 寄存器地址。
    pub fn modbus_address(&self) -> u16 {
        self.other_parameters.modbus.address
    }
}

/// 北向资源的协议附加参数。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtherParameters {
    #[serde(default)]
    pub modbus: ModbusParameters,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModbusParameters {
    #[serde(default)]
    pub address: u16,
}

/// 南向资源：设备侧点位定义。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SouthResource {
    pub name: String,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub read_write: ReadWrite,
    #[serde(default)]
    pub auto_upload: bool,
}

/// 南向读写权限。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ReadWrite {
    #[serde(rename = "R")]
    Read,
    #[serde(rename = "W")]
    Write,
    #[default]
    #[serde(rename = "RW")]
    ReadWrite,
}

impl ReadWrite {
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }
}

impl<'de> Deserialize<'de> for ReadWrite {
    // 设备侧该字段取值不规范，未知值一律按可读写处理。
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.trim().to_ascii_uppercase().as_str() {
            "R" => Self::Read,
            "W" => Self::Write,
            _ => Self::ReadWrite,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn device_mapping_decodes_wire_shape() {
        let raw = json!({
            "northDeviceName": "device1",
            "resources": [{
                "northResource": {
                    "name": "temp",
                    "valueType": "float32",
                    "scale": 1.0,
                    "offsetValue": 0.0,
                    "otherParameters": {"modbus": {"address": 1000}}
                },
                "southResource": {
                    "name": "temperature",
                    "valueType": "float32",
                    "scale": 1.0,
                    "offset": 0.0,
                    "readWrite": "R"
                }
            }]
        });
        let mapping: DeviceMapping = serde_json::from_value(raw).expect("decode");
        assert_eq!(mapping.north_device_name, "device1");
        let resource = &mapping.resources[0];
        let north = resource.north_resource.as_ref().expect("north");
        let south = resource.south_resource.as_ref().expect("south");
        assert_eq!(north.modbus_address(), 1000);
        assert_eq!(north.value_type, ValueType::Float32);
        assert_eq!(south.read_write, ReadWrite::Read);
        assert!(!south.read_write.is_writable());
    }

    #[test]
    fn missing_sides_decode_to_none() {
        let raw = json!({"northDeviceName": "d1", "resources": [{}]});
        let mapping: DeviceMapping = serde_json::from_value(raw).expect("decode");
        assert!(mapping.resources[0].north_resource.is_none());
        assert!(mapping.resources[0].south_resource.is_none());
    }

    #[test]
    fn unknown_read_write_defaults_to_rw() {
        let raw = json!({"name": "p", "valueType": "int16", "readWrite": "readonly?"});
        let south: SouthResource = serde_json::from_value(raw).expect("decode");
        assert_eq!(south.read_write, ReadWrite::ReadWrite);
    }
}
