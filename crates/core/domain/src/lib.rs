//! 网关共享领域模型：总线信封、设备映射、资源值。

pub mod envelope;
pub mod mapping;
pub mod value;

pub use envelope::{
    AttributePushPayload, BusRequest, BusResponse, CommandContent, CommandPayload,
    CommandReplyPayload, ForwardLogPayload, MessageType, QueryDevicesRequest,
    QueryDevicesResponse, TelemetryPayload, PROTOCOL_VERSION, QUERY_DEVICE_ATTRIBUTES_CMD,
};
pub use mapping::{DeviceMapping, NorthResource, ReadWrite, ResourceMapping, SouthResource};
pub use value::{ResourceValue, ValueType};

/// 领域层错误。
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedType { expected: u8, actual: u8 },
    #[error("payload decode error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// 当前时间戳（毫秒）。
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
