use gw_config::{GatewayConfig, TransportKind};

#[test]
fn load_config_from_env() {
    // Rust 2024 中 set_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        std::env::set_var("GW_NODE_ID", "node-1");
        std::env::set_var("GW_MQTT_HOST", "broker.local");
        std::env::set_var("GW_MQTT_PORT", "2883");
        std::env::set_var("GW_CACHE_TTL_MS", "5000");
        std::env::set_var("GW_HEARTBEAT_INTERVAL_SECONDS", "10");
    }

    let config = GatewayConfig::from_env().expect("config");
    assert_eq!(config.node_id, "node-1");
    assert_eq!(config.bus.broker_host, "broker.local");
    assert_eq!(config.bus.broker_port, 2883);
    assert_eq!(config.bus.qos, 1);
    assert_eq!(config.modbus.transport, TransportKind::Tcp);
    assert_eq!(config.modbus.tcp.port, 502);
    assert_eq!(config.cache.default_ttl_ms, 5000);
    assert_eq!(config.cache.default_ttl().as_millis(), 5000);
    assert_eq!(config.heartbeat_interval_secs, 10);
    assert_eq!(config.log_level, "info");
}
