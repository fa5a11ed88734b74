//! 北向 Modbus 服务端：TCP/RTU 帧处理、功能码分发、类型感知的寄存器装配。

pub mod config;
pub mod convert;
pub mod error;
pub mod frame;
pub mod reader;
pub mod server;

pub use config::{ModbusServerConfig, RtuServerConfig, TcpServerConfig, TransportConfig};
pub use convert::{ByteOrder, ConvertError, ValueConverter};
pub use error::{ExceptionCode, ModbusError};
pub use reader::{ReadOutcome, RegisterReader};
pub use server::{ModbusServer, RequestProcessor};
