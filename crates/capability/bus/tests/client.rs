//! 不依赖真实 broker 的客户端行为测试：发布进入请求队列即视为提交。

use domain::{BusRequest, MessageType};
use gw_bus::{BusClient, BusClientConfig, BusError};
use serde_json::json;
use std::time::Duration;

fn offline_client(client_id: &str) -> std::sync::Arc<BusClient> {
    // 端口 1 不可达，连接保持离线，事件循环按退避重试。
    BusClient::connect(BusClientConfig {
        node_id: "node-1".to_string(),
        broker_host: "127.0.0.1".to_string(),
        broker_port: 1,
        client_id: client_id.to_string(),
        username: None,
        password: None,
        qos: 1,
        keep_alive_secs: 30,
    })
}

#[tokio::test]
async fn publish_and_wait_times_out_and_clears_pending() {
    let client = offline_client("it-timeout");
    let request = BusRequest::new(MessageType::QueryDevices, json!({"cmd": "0101"}));

    let result = client
        .publish_and_wait(&request, Duration::from_millis(50))
        .await;

    match result {
        Err(BusError::Timeout { request_id, .. }) => assert_eq!(request_id, request.request_id),
        other => panic!("expected timeout, got {:?}", other.map(|_| ())),
    }
    assert_eq!(client.pending_request_count(), 0);
    client.shutdown().await;
}

#[tokio::test]
async fn wait_connected_times_out_without_broker() {
    let client = offline_client("it-connect");
    let result = client.wait_connected(Duration::from_millis(50)).await;
    assert!(matches!(result, Err(BusError::ConnectTimeout(_))));
    client.shutdown().await;
}

#[tokio::test]
async fn heartbeat_fires_immediately_then_on_interval() {
    let before = gw_telemetry::metrics().snapshot().heartbeats_sent;
    let client = offline_client("it-heartbeat");
    client.clone().start_heartbeat(Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(350)).await;
    client.stop_heartbeat().await;

    let sent = gw_telemetry::metrics().snapshot().heartbeats_sent - before;
    assert!(sent >= 4, "expected at least 4 heartbeats, got {}", sent);
    client.shutdown().await;
}
