//! Modbus 服务端配置。

use serde::{Deserialize, Serialize};

/// 服务端配置。同一实例只激活一种传输。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusServerConfig {
    pub transport: TransportConfig,
    /// RTU 从站号；TCP 下忽略 unit id。
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransportConfig {
    Tcp(TcpServerConfig),
    Rtu(RtuServerConfig),
}

/// TCP 监听配置。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// RTU 串口配置。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtuServerConfig {
    /// 串口设备路径。
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// N / E / O
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_slave_id() -> u8 {
    1
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_config_defaults() {
        let config: TcpServerConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 502);
    }

    #[test]
    fn rtu_config_defaults() {
        let config: RtuServerConfig =
            serde_json::from_str(r#"{"device": "/dev/ttyS0"}"#).expect("parse");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits, 8);
        assert_eq!(config.parity, "N");
        assert_eq!(config.stop_bits, 1);
        assert_eq!(config.timeout_ms, 1000);
    }
}
