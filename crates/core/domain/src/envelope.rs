//! 总线报文信封与类型化负载。
//!
//! 所有总线载荷均为 JSON 信封：请求带 `requestId/version/type/timestamp/payload`，
//! 响应在此之上追加 `code/msg`，两者仅靠非零 `code` 区分。

use crate::mapping::DeviceMapping;
use crate::{now_epoch_ms, DomainError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 信封协议版本（固定字面量）。
pub const PROTOCOL_VERSION: &str = "1.0";

/// 查询设备属性的命令字。
pub const QUERY_DEVICE_ATTRIBUTES_CMD: &str = "0101";

/// 报文类型标签（封闭枚举）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// 心跳
    Heartbeat = 1,
    /// 查询设备属性
    QueryDevices = 2,
    /// 设备属性下发
    AttributePush = 3,
    /// 遥测数据
    Telemetry = 4,
    /// 转发日志
    ForwardLog = 5,
    /// 命令下发
    Command = 6,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Heartbeat),
            2 => Ok(Self::QueryDevices),
            3 => Ok(Self::AttributePush),
            4 => Ok(Self::Telemetry),
            5 => Ok(Self::ForwardLog),
            6 => Ok(Self::Command),
            other => Err(DomainError::UnknownMessageType(other)),
        }
    }
}

/// 请求信封。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusRequest {
    pub request_id: String,
    pub version: String,
    #[serde(rename = "type")]
    pub msg_type: u8,
    pub timestamp: i64,
    #[serde(default)]
    pub payload: Value,
}

impl BusRequest {
    /// 构造新请求：新鲜 requestId 与当前时间戳。
    pub fn new(msg_type: MessageType, payload: Value) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            version: PROTOCOL_VERSION.to_string(),
            msg_type: msg_type.as_u8(),
            timestamp: now_epoch_ms(),
            payload,
        }
    }

    pub fn telemetry_payload(&self) -> Result<TelemetryPayload, DomainError> {
        self.typed_payload(MessageType::Telemetry)
    }

    pub fn attribute_push_payload(&self) -> Result<AttributePushPayload, DomainError> {
        self.typed_payload(MessageType::AttributePush)
    }

    pub fn command_payload(&self) -> Result<CommandPayload, DomainError> {
        self.typed_payload(MessageType::Command)
    }

    fn typed_payload<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, DomainError> {
        if self.msg_type != expected.as_u8() {
            return Err(DomainError::UnexpectedType {
                expected: expected.as_u8(),
                actual: self.msg_type,
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// 响应信封。请求信封之外多出 `code/msg`；`code` 非零即视为响应。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusResponse {
    pub request_id: String,
    pub version: String,
    #[serde(rename = "type")]
    pub msg_type: u8,
    pub timestamp: i64,
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub payload: Value,
}

impl BusResponse {
    /// 构造对指定请求的应答，回显其 requestId。
    pub fn reply(
        request_id: impl Into<String>,
        msg_type: MessageType,
        code: i32,
        msg: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            version: PROTOCOL_VERSION.to_string(),
            msg_type: msg_type.as_u8(),
            timestamp: now_epoch_ms(),
            code,
            msg: msg.into(),
            payload,
        }
    }

    pub fn query_devices_payload(&self) -> Result<QueryDevicesResponse, DomainError> {
        if self.msg_type != MessageType::QueryDevices.as_u8() {
            return Err(DomainError::UnexpectedType {
                expected: MessageType::QueryDevices.as_u8(),
                actual: self.msg_type,
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// type=2 查询设备属性请求负载。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDevicesRequest {
    pub cmd: String,
}

impl QueryDevicesRequest {
    pub fn attributes() -> Self {
        Self {
            cmd: QUERY_DEVICE_ATTRIBUTES_CMD.to_string(),
        }
    }
}

/// type=2 查询设备属性响应负载。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDevicesResponse {
    pub cmd: String,
    #[serde(default)]
    pub result: Vec<DeviceMapping>,
}

/// type=3 设备属性下发负载。
///
/// 上游存在 `devices` 与 `result` 两种字段名，解码时同时接受，编码固定用 `devices`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributePushPayload {
    #[serde(default, alias = "result")]
    pub devices: Vec<DeviceMapping>,
}

/// type=4 遥测数据负载。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    pub north_device_name: String,
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
}

/// type=5 转发日志负载。`status`：1 成功，0 失败。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardLogPayload {
    pub status: i32,
    pub north_device_name: String,
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
}

/// type=6 命令下发负载。`cmdType`："GET" / "PUT"。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub cmd_type: String,
    pub cmd_content: CommandContent,
}

/// 命令内容。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandContent {
    pub north_device_name: String,
    pub north_resource_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub north_resource_value: Option<String>,
}

/// type=6 命令应答负载。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReplyPayload {
    pub cmd_type: String,
    pub status_code: i32,
    pub cmd_content: CommandContent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips_over_json() {
        let request = BusRequest::new(
            MessageType::Telemetry,
            json!({"northDeviceName": "device1", "data": {"temp": 25.5}}),
        );
        let encoded = serde_json::to_string(&request).expect("encode");
        let decoded: BusRequest = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, request);
    }

    #[test]
    fn response_round_trips_over_json() {
        let response = BusResponse::reply("req-1", MessageType::QueryDevices, 200, "ok", json!({}));
        let encoded = serde_json::to_string(&response).expect("encode");
        let decoded: BusResponse = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, response);
    }

    #[test]
    fn request_decodes_as_response_with_zero_code() {
        // 请求与响应结构同形，仅靠非零 code 区分。
        let request = BusRequest::new(MessageType::Heartbeat, json!({}));
        let raw = serde_json::to_vec(&request).expect("encode");
        let as_response: BusResponse = serde_json::from_slice(&raw).expect("decode");
        assert_eq!(as_response.code, 0);
    }

    #[test]
    fn attribute_push_accepts_both_field_names() {
        let devices = json!({"devices": [{"northDeviceName": "d1", "resources": []}]});
        let result = json!({"result": [{"northDeviceName": "d1", "resources": []}]});
        let a: AttributePushPayload = serde_json::from_value(devices).expect("devices");
        let b: AttributePushPayload = serde_json::from_value(result).expect("result");
        assert_eq!(a.devices.len(), 1);
        assert_eq!(b.devices.len(), 1);
    }

    #[test]
    fn typed_payload_rejects_wrong_type_tag() {
        let request = BusRequest::new(MessageType::Heartbeat, json!({}));
        assert!(request.telemetry_payload().is_err());
    }

    #[test]
    fn command_value_is_optional() {
        let payload = json!({
            "cmdType": "GET",
            "cmdContent": {"northDeviceName": "d1", "northResourceName": "temp"}
        });
        let command: CommandPayload = serde_json::from_value(payload).expect("decode");
        assert_eq!(command.cmd_type, "GET");
        assert!(command.cmd_content.north_resource_value.is_none());
    }
}
