//! 总线客户端：类型化信封收发、请求应答关联、心跳与处理器分发。
//!
//! 上行订阅 `/v1/data/{nodeId}/up`，下行发布 `/v1/data/{nodeId}/down`。
//! 入站载荷先按响应解码并检查非零 `code`，否则按请求解码。

use async_trait::async_trait;
use domain::{BusRequest, BusResponse, MessageType};
use gw_telemetry::{
    record_bus_decode_error, record_bus_message_in, record_bus_message_out,
    record_heartbeat_sent, record_pending_timeout,
};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 总线客户端错误。
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish error: {0}")]
    Publish(String),
    #[error("subscribe error: {0}")]
    Subscribe(String),
    #[error("broker connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("request {request_id} timed out after {timeout:?}")]
    Timeout {
        request_id: String,
        timeout: Duration,
    },
    #[error("response channel closed for request {0}")]
    ChannelClosed(String),
    #[error("handler error: {0}")]
    Handler(String),
}

/// 请求处理器，按报文类型注册。
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: BusRequest) -> Result<(), BusError>;
}

/// 响应处理器，处理未被等待者认领的响应。
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle(&self, response: BusResponse) -> Result<(), BusError>;
}

/// 总线连接配置。
#[derive(Debug, Clone)]
pub struct BusClientConfig {
    pub node_id: String,
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    pub keep_alive_secs: u64,
}

/// 入站分发状态：待响应表与处理器注册表。
///
/// 两张处理器表与待响应表各用独立锁，注册允许与分发并发。
struct Dispatcher {
    pending: Mutex<HashMap<String, mpsc::Sender<BusResponse>>>,
    request_handlers: RwLock<HashMap<MessageType, Arc<dyn RequestHandler>>>,
    response_handlers: RwLock<HashMap<MessageType, Arc<dyn ResponseHandler>>>,
}

impl Dispatcher {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            request_handlers: RwLock::new(HashMap::new()),
            response_handlers: RwLock::new(HashMap::new()),
        }
    }

    async fn dispatch(&self, raw: &[u8]) {
        record_bus_message_in();

        // 先按响应解码：请求与响应同形，仅靠非零 code 区分。
        if let Ok(response) = serde_json::from_slice::<BusResponse>(raw) {
            if response.code != 0 {
                self.dispatch_response(response).await;
                return;
            }
        }

        match serde_json::from_slice::<BusRequest>(raw) {
            Ok(request) => self.dispatch_request(request).await,
            Err(err) => {
                record_bus_decode_error();
                error!(target: "gw.bus", "failed to decode bus payload: {}", err);
            }
        }
    }

    async fn dispatch_response(&self, response: BusResponse) {
        debug!(
            target: "gw.bus",
            msg_type = response.msg_type,
            request_id = %response.request_id,
            code = response.code,
            "response received"
        );

        // 待响应表命中：恰好投递一次，移除后 try_send 不阻塞分发线程。
        let waiter = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&response.request_id)
        };
        if let Some(tx) = waiter {
            let _ = tx.try_send(response);
            return;
        }

        let handler = match MessageType::try_from(response.msg_type) {
            Ok(msg_type) => {
                let handlers = self
                    .response_handlers
                    .read()
                    .unwrap_or_else(|e| e.into_inner());
                handlers.get(&msg_type).cloned()
            }
            Err(_) => None,
        };
        if let Some(handler) = handler {
            if let Err(err) = handler.handle(response.clone()).await {
                error!(
                    target: "gw.bus",
                    msg_type = response.msg_type,
                    "response handler error: {}",
                    err
                );
            }
        }
    }

    async fn dispatch_request(&self, request: BusRequest) {
        debug!(
            target: "gw.bus",
            msg_type = request.msg_type,
            request_id = %request.request_id,
            "request received"
        );

        let handler = match MessageType::try_from(request.msg_type) {
            Ok(msg_type) => {
                let handlers = self
                    .request_handlers
                    .read()
                    .unwrap_or_else(|e| e.into_inner());
                handlers.get(&msg_type).cloned()
            }
            Err(_) => None,
        };
        match handler {
            Some(handler) => {
                let msg_type = request.msg_type;
                if let Err(err) = handler.handle(request).await {
                    error!(target: "gw.bus", msg_type, "request handler error: {}", err);
                }
            }
            None => {
                warn!(
                    target: "gw.bus",
                    msg_type = request.msg_type,
                    "no handler registered for message type"
                );
            }
        }
    }
}

struct TaskHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// 总线客户端。
pub struct BusClient {
    client: AsyncClient,
    node_id: String,
    topic_up: String,
    topic_down: String,
    qos: QoS,
    dispatcher: Arc<Dispatcher>,
    connected: watch::Receiver<bool>,
    event_loop: Mutex<Option<TaskHandle>>,
    heartbeat: Mutex<Option<TaskHandle>>,
}

impl BusClient {
    /// 建立客户端并启动事件循环。连接惰性建立，可用 [`wait_connected`] 等待首个确认。
    ///
    /// 每次（重）连接成功都会重新订阅上行主题；订阅状态不在客户端侧跟踪。
    ///
    /// [`wait_connected`]: BusClient::wait_connected
    pub fn connect(config: BusClientConfig) -> Arc<Self> {
        let topic_up = format!("/v1/data/{}/up", config.node_id);
        let topic_down = format!("/v1/data/{}/down", config.node_id);
        let qos = qos_from_u8(config.qos);

        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (config.username, config.password) {
            options.set_credentials(username, password);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 10);
        let dispatcher = Arc::new(Dispatcher::new());
        let (connected_tx, connected_rx) = watch::channel(false);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let loop_client = client.clone();
        let loop_dispatcher = Arc::clone(&dispatcher);
        let loop_topic = topic_up.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        info!(target: "gw.bus", "event loop stopped");
                        break;
                    }
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!(target: "gw.bus", topic = %loop_topic, "broker connected, subscribing uplink");
                            let _ = connected_tx.send(true);
                            if let Err(err) = loop_client.subscribe(&loop_topic, qos).await {
                                warn!(target: "gw.bus", "uplink subscribe failed: {}", err);
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            loop_dispatcher.dispatch(&publish.payload).await;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            let _ = connected_tx.send(false);
                            warn!(target: "gw.bus", "event loop error: {}", err);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });

        Arc::new(Self {
            client,
            node_id: config.node_id,
            topic_up,
            topic_down,
            qos,
            dispatcher,
            connected: connected_rx,
            event_loop: Mutex::new(Some(TaskHandle {
                stop: stop_tx,
                handle,
            })),
            heartbeat: Mutex::new(None),
        })
    }

    /// 等待首个连接确认；超时向调用方返回错误。
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), BusError> {
        let mut connected = self.connected.clone();
        let wait = connected.wait_for(|ready| *ready);
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(BusError::ConnectTimeout(timeout)),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn uplink_topic(&self) -> &str {
        &self.topic_up
    }

    /// 注册请求处理器（同类型后注册者覆盖前者）。
    pub fn register_request_handler(&self, msg_type: MessageType, handler: Arc<dyn RequestHandler>) {
        let mut handlers = self
            .dispatcher
            .request_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        handlers.insert(msg_type, handler);
    }

    /// 注册响应处理器。
    pub fn register_response_handler(
        &self,
        msg_type: MessageType,
        handler: Arc<dyn ResponseHandler>,
    ) {
        let mut handlers = self
            .dispatcher
            .response_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        handlers.insert(msg_type, handler);
    }

    /// 发布请求到下行主题。
    pub async fn publish(&self, request: &BusRequest) -> Result<(), BusError> {
        let payload = serde_json::to_vec(request)?;
        self.client
            .publish(&self.topic_down, self.qos, false, payload)
            .await
            .map_err(|err| BusError::Publish(err.to_string()))?;
        record_bus_message_out();
        debug!(
            target: "gw.bus",
            msg_type = request.msg_type,
            request_id = %request.request_id,
            "request published"
        );
        Ok(())
    }

    /// 发布响应到下行主题。
    pub async fn publish_response(&self, response: &BusResponse) -> Result<(), BusError> {
        let payload = serde_json::to_vec(response)?;
        self.client
            .publish(&self.topic_down, self.qos, false, payload)
            .await
            .map_err(|err| BusError::Publish(err.to_string()))?;
        record_bus_message_out();
        debug!(
            target: "gw.bus",
            msg_type = response.msg_type,
            request_id = %response.request_id,
            code = response.code,
            "response published"
        );
        Ok(())
    }

    /// 发布请求并等待 requestId 匹配的响应。
    ///
    /// 发布失败与超时都会清理待响应表；该调用恰好返回一次。
    pub async fn publish_and_wait(
        &self,
        request: &BusRequest,
        timeout: Duration,
    ) -> Result<BusResponse, BusError> {
        let (tx, mut rx) = mpsc::channel(1);
        {
            let mut pending = self
                .dispatcher
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.insert(request.request_id.clone(), tx);
        }

        if let Err(err) = self.publish(request).await {
            self.remove_pending(&request.request_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => {
                self.remove_pending(&request.request_id);
                Err(BusError::ChannelClosed(request.request_id.clone()))
            }
            Err(_) => {
                self.remove_pending(&request.request_id);
                record_pending_timeout();
                Err(BusError::Timeout {
                    request_id: request.request_id.clone(),
                    timeout,
                })
            }
        }
    }

    fn remove_pending(&self, request_id: &str) {
        let mut pending = self
            .dispatcher
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        pending.remove(request_id);
    }

    /// 当前待响应条目数。
    pub fn pending_request_count(&self) -> usize {
        self.dispatcher
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// 启动周期心跳（type=1，空负载），首个心跳立即发送。重复调用先停旧任务。
    pub fn start_heartbeat(self: Arc<Self>, interval: Duration) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let client = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => client.send_heartbeat().await,
                    _ = stop_rx.changed() => {
                        info!(target: "gw.bus", "heartbeat stopped");
                        break;
                    }
                }
            }
        });

        let previous = {
            let mut slot = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
            slot.replace(TaskHandle {
                stop: stop_tx,
                handle,
            })
        };
        if let Some(previous) = previous {
            let _ = previous.stop.send(true);
            previous.handle.abort();
        }
        info!(target: "gw.bus", interval_ms = interval.as_millis() as u64, "heartbeat started");
    }

    async fn send_heartbeat(&self) {
        let request = BusRequest::new(MessageType::Heartbeat, json!({}));
        match self.publish(&request).await {
            Ok(()) => {
                record_heartbeat_sent();
                debug!(target: "gw.bus", "heartbeat sent");
            }
            Err(err) => error!(target: "gw.bus", "failed to send heartbeat: {}", err),
        }
    }

    /// 停止心跳任务并等待退出。
    pub async fn stop_heartbeat(&self) {
        let task = {
            let mut slot = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(task) = task {
            let _ = task.stop.send(true);
            let _ = task.handle.await;
        }
    }

    /// 停止心跳、断开连接并等待事件循环退出。
    pub async fn shutdown(&self) {
        self.stop_heartbeat().await;
        let task = {
            let mut slot = self.event_loop.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(task) = task {
            let _ = task.stop.send(true);
            let _ = self.client.disconnect().await;
            let _ = task.handle.await;
        }
        info!(target: "gw.bus", "bus client disconnected");
    }

    #[cfg(test)]
    async fn dispatch_raw(&self, raw: &[u8]) {
        self.dispatcher.dispatch(raw).await;
    }
}

fn qos_from_u8(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_client() -> Arc<BusClient> {
        BusClient::connect(BusClientConfig {
            node_id: "node-test".to_string(),
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1,
            client_id: format!("test-{}", uuid_like()),
            username: None,
            password: None,
            qos: 1,
            keep_alive_secs: 30,
        })
    }

    fn uuid_like() -> String {
        format!("{:x}", domain::now_epoch_ms())
    }

    struct CountingHandler {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl RequestHandler for CountingHandler {
        async fn handle(&self, _request: BusRequest) -> Result<(), BusError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn topics_follow_node_id() {
        let client = test_client();
        assert_eq!(client.uplink_topic(), "/v1/data/node-test/up");
        client.shutdown().await;
    }

    #[tokio::test]
    async fn request_routes_to_registered_handler() {
        let client = test_client();
        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
        });
        client.register_request_handler(MessageType::Telemetry, handler.clone());

        let request = BusRequest::new(MessageType::Telemetry, json!({"northDeviceName": "d1"}));
        let raw = serde_json::to_vec(&request).expect("encode");
        client.dispatch_raw(&raw).await;

        assert_eq!(handler.seen.load(Ordering::SeqCst), 1);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn response_with_zero_code_is_treated_as_request() {
        let client = test_client();
        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
        });
        client.register_request_handler(MessageType::Telemetry, handler.clone());

        // code 缺省为 0，应走请求分发路径。
        let raw = serde_json::to_vec(&BusRequest::new(MessageType::Telemetry, json!({})))
            .expect("encode");
        client.dispatch_raw(&raw).await;
        assert_eq!(handler.seen.load(Ordering::SeqCst), 1);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn pending_response_is_delivered_exactly_once() {
        let client = test_client();
        let (tx, mut rx) = mpsc::channel(1);
        {
            let mut pending = client.dispatcher.pending.lock().expect("lock");
            pending.insert("req-1".to_string(), tx);
        }

        let response = BusResponse::reply("req-1", MessageType::QueryDevices, 200, "ok", json!({}));
        let raw = serde_json::to_vec(&response).expect("encode");
        client.dispatch_raw(&raw).await;
        // 重复响应不再有等待者，也不得阻塞分发。
        client.dispatch_raw(&raw).await;

        assert_eq!(rx.recv().await.expect("delivered").code, 200);
        assert!(rx.try_recv().is_err());
        assert_eq!(client.pending_request_count(), 0);
        client.shutdown().await;
    }
}
