//! Modbus 服务端错误与协议异常码。

use crate::convert::ConvertError;

/// 服务端内部错误。协议层面的失败用 [`ExceptionCode`] 回给客户端。
#[derive(Debug, thiserror::Error)]
pub enum ModbusError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("invalid serial parameter {0}: {1}")]
    SerialParameter(&'static str, String),

    #[error("server already running")]
    AlreadyRunning,

    #[error("frame too short: {0} bytes")]
    ShortFrame(usize),

    #[error("frame too long: {0} bytes")]
    OversizedFrame(usize),

    #[error("crc mismatch: expected {expected:#06x}, received {received:#06x}")]
    CrcMismatch { expected: u16, received: u16 },

    #[error("conversion error: {0}")]
    Convert(#[from] ConvertError),
}

/// Modbus 应答异常码。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

impl ExceptionCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
