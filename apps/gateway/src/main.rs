//! 网关进程装配：总线客户端、映射缓存、转发日志与 Modbus 服务端的接线。

mod handlers;

use domain::MessageType;
use gw_bus::{BusClient, BusClientConfig};
use gw_config::{GatewayConfig, ModbusConfig, TransportKind};
use gw_forwardlog::{ForwardLogConfig, ForwardLogSink};
use gw_mapping::MappingService;
use gw_modbus::{
    ModbusServer, ModbusServerConfig, RtuServerConfig, TcpServerConfig, TransportConfig,
};
use gw_telemetry::init_tracing;
use handlers::{
    AttributePushHandler, CommandHandler, DeviceQueryResponseHandler, TelemetryHandler,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    let config = GatewayConfig::from_env()?;
    // 句柄保留：LogLevel 是运行期可调旋钮
    let _log_level = init_tracing(&config.log_level);
    info!(target: "gw.app", node_id = %config.node_id, "gateway starting");

    let bus = BusClient::connect(BusClientConfig {
        node_id: config.node_id.clone(),
        broker_host: config.bus.broker_host.clone(),
        broker_port: config.bus.broker_port,
        client_id: config.bus.client_id.clone(),
        username: config.bus.username.clone(),
        password: config.bus.password.clone(),
        qos: config.bus.qos,
        keep_alive_secs: config.bus.keep_alive_secs,
    });
    let request_timeout = Duration::from_secs(config.request_timeout_secs);
    if let Err(err) = bus.wait_connected(request_timeout).await {
        // 总线不可达时仍然拉起本地服务，事件循环会按退避重连。
        warn!(target: "gw.app", "broker not reachable yet: {}", err);
    }

    let mappings = Arc::new(MappingService::new(config.cache.default_ttl()));
    let sink = Arc::new(ForwardLogSink::new(
        bus.clone(),
        ForwardLogConfig::default(),
    ));
    sink.clone().start();
    mappings.set_forward_log_handler(sink.clone());

    bus.register_request_handler(
        MessageType::AttributePush,
        Arc::new(AttributePushHandler::new(mappings.clone())),
    );
    bus.register_request_handler(
        MessageType::Telemetry,
        Arc::new(TelemetryHandler::new(mappings.clone())),
    );
    bus.register_request_handler(
        MessageType::Command,
        Arc::new(CommandHandler::new(mappings.clone(), bus.clone())),
    );
    bus.register_response_handler(
        MessageType::QueryDevices,
        Arc::new(DeviceQueryResponseHandler::new(mappings.clone())),
    );

    if let Err(err) = mappings.query_device_attributes(&bus, request_timeout).await {
        warn!(
            target: "gw.app",
            "device attribute query failed, waiting for pushes: {}",
            err
        );
    }

    bus.clone()
        .start_heartbeat(Duration::from_secs(config.heartbeat_interval_secs));
    mappings.start_sweep(config.cache.sweep_interval());

    let modbus = ModbusServer::new(modbus_server_config(&config.modbus), mappings.clone());
    modbus.start().await?;

    info!(target: "gw.app", "gateway started");
    tokio::signal::ctrl_c().await?;
    info!(target: "gw.app", "shutdown signal received");

    modbus.stop().await;
    sink.stop().await;
    mappings.stop().await;
    bus.shutdown().await;
    info!(target: "gw.app", "gateway stopped");
    Ok(())
}

fn modbus_server_config(config: &ModbusConfig) -> ModbusServerConfig {
    let transport = match config.transport {
        TransportKind::Tcp => TransportConfig::Tcp(TcpServerConfig {
            host: config.tcp.host.clone(),
            port: config.tcp.port,
        }),
        TransportKind::Rtu => TransportConfig::Rtu(RtuServerConfig {
            device: config.rtu.device.clone(),
            baud_rate: config.rtu.baud_rate,
            data_bits: config.rtu.data_bits,
            parity: config.rtu.parity.clone(),
            stop_bits: config.rtu.stop_bits,
            timeout_ms: config.rtu.timeout_ms,
        }),
    };
    ModbusServerConfig {
        transport,
        slave_id: config.slave_id,
    }
}
