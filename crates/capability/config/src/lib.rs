//! 网关运行配置加载。

use std::env;
use std::time::Duration;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 总线连接配置。
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    pub keep_alive_secs: u64,
}

/// Modbus 监听端配置。同一实例只激活一种传输。
#[derive(Debug, Clone)]
pub struct ModbusConfig {
    pub transport: TransportKind,
    pub tcp: TcpConfig,
    pub rtu: RtuConfig,
    pub slave_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Rtu,
}

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct RtuConfig {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    /// N / E / O
    pub parity: String,
    pub stop_bits: u8,
    pub timeout_ms: u64,
}

/// 寄存器缓存配置。
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// 网关运行配置。
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub node_id: String,
    pub bus: BusConfig,
    pub modbus: ModbusConfig,
    pub cache: CacheConfig,
    pub heartbeat_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub log_level: String,
}

impl GatewayConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id =
            env::var("GW_NODE_ID").map_err(|_| ConfigError::Missing("GW_NODE_ID".to_string()))?;

        let broker_host = env::var("GW_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let broker_port = read_u16_with_default("GW_MQTT_PORT", 1883)?;
        let client_id = env::var("GW_MQTT_CLIENT_ID")
            .unwrap_or_else(|_| format!("gateway-{}", uuid::Uuid::new_v4()));
        let username = read_optional("GW_MQTT_USERNAME");
        let password = read_optional("GW_MQTT_PASSWORD");
        let qos = read_u8_with_default("GW_MQTT_QOS", 1)?;
        let keep_alive_secs = read_u64_with_default("GW_MQTT_KEEP_ALIVE_SECONDS", 30)?;

        let transport = read_transport("GW_MODBUS_TRANSPORT")?;
        let tcp = TcpConfig {
            host: env::var("GW_MODBUS_TCP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: read_u16_with_default("GW_MODBUS_TCP_PORT", 502)?,
        };
        let rtu = RtuConfig {
            device: env::var("GW_MODBUS_RTU_DEVICE").unwrap_or_default(),
            baud_rate: read_u32_with_default("GW_MODBUS_RTU_BAUD", 9600)?,
            data_bits: read_u8_with_default("GW_MODBUS_RTU_DATA_BITS", 8)?,
            parity: env::var("GW_MODBUS_RTU_PARITY").unwrap_or_else(|_| "N".to_string()),
            stop_bits: read_u8_with_default("GW_MODBUS_RTU_STOP_BITS", 1)?,
            timeout_ms: read_u64_with_default("GW_MODBUS_RTU_TIMEOUT_MS", 1000)?,
        };
        if transport == TransportKind::Rtu && rtu.device.is_empty() {
            return Err(ConfigError::Missing("GW_MODBUS_RTU_DEVICE".to_string()));
        }
        let slave_id = read_u8_with_default("GW_MODBUS_SLAVE_ID", 1)?;

        let cache = CacheConfig {
            default_ttl_ms: read_u64_with_default("GW_CACHE_TTL_MS", 30_000)?,
            sweep_interval_ms: read_u64_with_default("GW_CACHE_SWEEP_INTERVAL_MS", 10_000)?,
        };

        let heartbeat_interval_secs = read_u64_with_default("GW_HEARTBEAT_INTERVAL_SECONDS", 30)?;
        let request_timeout_secs = read_u64_with_default("GW_REQUEST_TIMEOUT_SECONDS", 30)?;
        let log_level = env::var("GW_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            node_id,
            bus: BusConfig {
                broker_host,
                broker_port,
                client_id,
                username,
                password,
                qos,
                keep_alive_secs,
            },
            modbus: ModbusConfig {
                transport,
                tcp,
                rtu,
                slave_id,
            },
            cache,
            heartbeat_interval_secs,
            request_timeout_secs,
            log_level,
        })
    }
}

fn read_transport(key: &str) -> Result<TransportKind, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(TransportKind::Tcp),
    };
    match value.to_ascii_uppercase().as_str() {
        "TCP" => Ok(TransportKind::Tcp),
        "RTU" => Ok(TransportKind::Rtu),
        _ => Err(ConfigError::Invalid(key.to_string(), value)),
    }
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u32_with_default(key: &str, default: u32) -> Result<u32, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u32>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u8_with_default(key: &str, default: u8) -> Result<u8, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u8>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}
