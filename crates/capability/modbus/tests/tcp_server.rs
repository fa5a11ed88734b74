//! TCP 端到端测试：真实监听端口上的 MBAP 往返与生命周期。

use gw_mapping::MappingService;
use gw_modbus::{ModbusError, ModbusServer, ModbusServerConfig, TcpServerConfig, TransportConfig};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn mappings() -> Arc<MappingService> {
    let service = MappingService::new(Duration::from_secs(60));
    let devices = serde_json::from_value(json!([{
        "northDeviceName": "device1",
        "resources": [{
            "northResource": {
                "name": "temp", "valueType": "float32", "scale": 1.0, "offsetValue": 0.0,
                "otherParameters": {"modbus": {"address": 1000}}
            },
            "southResource": {
                "name": "temp", "valueType": "float32", "scale": 1.0, "offset": 0.0,
                "readWrite": "R"
            }
        }]
    }]))
    .expect("devices");
    service.update_mappings(devices);

    let mut data = Map::new();
    data.insert("temp".to_string(), json!(25.5));
    service.update_cache("device1", &data).expect("telemetry");
    Arc::new(service)
}

fn server(mappings: Arc<MappingService>) -> ModbusServer {
    ModbusServer::new(
        ModbusServerConfig {
            transport: TransportConfig::Tcp(TcpServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            }),
            slave_id: 1,
        },
        mappings,
    )
}

async fn round_trip(stream: &mut TcpStream, transaction_id: u16, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&((pdu.len() as u16 + 1).to_be_bytes()));
    frame.push(0x01);
    frame.extend_from_slice(pdu);
    stream.write_all(&frame).await.expect("write");

    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await.expect("read header");
    assert_eq!(u16::from_be_bytes([header[0], header[1]]), transaction_id);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut response = vec![0u8; length - 1];
    stream.read_exact(&mut response).await.expect("read pdu");
    response
}

#[tokio::test]
async fn holding_register_read_over_tcp() {
    let server = server(mappings());
    server.start().await.expect("start");
    let addr = server.tcp_local_addr().expect("addr");

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let response = round_trip(&mut stream, 1, &[0x03, 0x03, 0xE8, 0x00, 0x02]).await;
    assert_eq!(response, vec![0x03, 0x04, 0x41, 0xCC, 0x00, 0x00]);

    // 同一连接连续请求。
    let exception = round_trip(&mut stream, 2, &[0x03, 0x03, 0xE8, 0x00, 0x7E]).await;
    assert_eq!(exception, vec![0x83, 0x03]);

    server.stop().await;
}

#[tokio::test]
async fn double_start_is_rejected_and_stop_is_idempotent() {
    let server = server(mappings());
    server.start().await.expect("start");
    assert!(server.is_running());
    assert!(matches!(
        server.start().await,
        Err(ModbusError::AlreadyRunning)
    ));

    server.stop().await;
    assert!(!server.is_running());
    // 重复停止为空操作。
    server.stop().await;

    // 停止后可重新启动。
    server.start().await.expect("restart");
    server.stop().await;
}

#[tokio::test]
async fn stop_closes_the_listener() {
    let server = server(mappings());
    server.start().await.expect("start");
    let addr = server.tcp_local_addr().expect("addr");
    server.stop().await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}
