//! 总线入站请求处理器：属性下发、遥测、命令。

use async_trait::async_trait;
use domain::{
    BusRequest, BusResponse, CommandContent, CommandPayload, CommandReplyPayload, MessageType,
};
use gw_bus::{BusClient, BusError, RequestHandler, ResponseHandler};
use gw_mapping::MappingService;
use std::sync::Arc;
use tracing::warn;

/// type=2 查询响应：等待者超时后才到达的应答同样用于重建映射。
pub struct DeviceQueryResponseHandler {
    mappings: Arc<MappingService>,
}

impl DeviceQueryResponseHandler {
    pub fn new(mappings: Arc<MappingService>) -> Self {
        Self { mappings }
    }
}

#[async_trait]
impl ResponseHandler for DeviceQueryResponseHandler {
    async fn handle(&self, response: BusResponse) -> Result<(), BusError> {
        if response.code != 200 {
            warn!(
                target: "gw.app",
                code = response.code,
                "device query response rejected"
            );
            return Ok(());
        }
        let payload = response
            .query_devices_payload()
            .map_err(|err| BusError::Handler(err.to_string()))?;
        self.mappings.update_mappings(payload.result);
        Ok(())
    }
}

/// type=3 设备属性下发：整体重建映射。
pub struct AttributePushHandler {
    mappings: Arc<MappingService>,
}

impl AttributePushHandler {
    pub fn new(mappings: Arc<MappingService>) -> Self {
        Self { mappings }
    }
}

#[async_trait]
impl RequestHandler for AttributePushHandler {
    async fn handle(&self, request: BusRequest) -> Result<(), BusError> {
        self.mappings
            .handle_attribute_push(&request)
            .map(|_| ())
            .map_err(|err| BusError::Handler(err.to_string()))
    }
}

/// type=4 遥测：写入寄存器缓存。
pub struct TelemetryHandler {
    mappings: Arc<MappingService>,
}

impl TelemetryHandler {
    pub fn new(mappings: Arc<MappingService>) -> Self {
        Self { mappings }
    }
}

#[async_trait]
impl RequestHandler for TelemetryHandler {
    async fn handle(&self, request: BusRequest) -> Result<(), BusError> {
        self.mappings
            .handle_telemetry(&request)
            .map(|_| ())
            .map_err(|err| BusError::Handler(err.to_string()))
    }
}

/// type=6 命令：GET 读缓存，PUT 做权限检查后应答。
pub struct CommandHandler {
    mappings: Arc<MappingService>,
    bus: Arc<BusClient>,
}

impl CommandHandler {
    pub fn new(mappings: Arc<MappingService>, bus: Arc<BusClient>) -> Self {
        Self { mappings, bus }
    }

    fn execute(&self, command: &CommandPayload) -> CommandReplyPayload {
        match command.cmd_type.to_ascii_uppercase().as_str() {
            "GET" => self.execute_get(command),
            "PUT" => CommandReplyPayload {
                cmd_type: command.cmd_type.clone(),
                status_code: self.execute_put(&command.cmd_content),
                cmd_content: command.cmd_content.clone(),
            },
            other => {
                warn!(target: "gw.app", cmd_type = other, "unsupported command type");
                CommandReplyPayload {
                    cmd_type: command.cmd_type.clone(),
                    status_code: 400,
                    cmd_content: command.cmd_content.clone(),
                }
            }
        }
    }

    fn execute_get(&self, command: &CommandPayload) -> CommandReplyPayload {
        let content = &command.cmd_content;
        let mut reply = CommandContent {
            north_device_name: content.north_device_name.clone(),
            north_resource_name: content.north_resource_name.clone(),
            north_resource_value: None,
        };
        // 未知设备/资源与过期缓存对调用方同样是 404。
        let status_code = match self
            .lookup_address(&content.north_device_name, &content.north_resource_name)
            .and_then(|address| self.mappings.cached_value(address))
        {
            Some(datum) => {
                reply.north_resource_value = Some(datum.value.to_string());
                200
            }
            None => 404,
        };
        CommandReplyPayload {
            cmd_type: command.cmd_type.clone(),
            status_code,
            cmd_content: reply,
        }
    }

    fn execute_put(&self, content: &CommandContent) -> i32 {
        let Some(address) =
            self.lookup_address(&content.north_device_name, &content.north_resource_name)
        else {
            return 404;
        };
        let Some(binding) = self.mappings.mapping_by_address(address) else {
            return 404;
        };
        if let Some(south) = &binding.mapping.south_resource {
            if !south.read_write.is_writable() {
                return 403;
            }
        }
        // TODO: 南向写入尚未经总线下发，这里先按接受应答。
        200
    }

    fn lookup_address(&self, device: &str, resource: &str) -> Option<u16> {
        let mapping = self.mappings.device_mapping(device)?;
        mapping.resources.iter().find_map(|binding| {
            let north = binding.north_resource.as_ref()?;
            (north.name == resource).then(|| north.modbus_address())
        })
    }
}

#[async_trait]
impl RequestHandler for CommandHandler {
    async fn handle(&self, request: BusRequest) -> Result<(), BusError> {
        let payload = request
            .command_payload()
            .map_err(|err| BusError::Handler(err.to_string()))?;
        let reply = self.execute(&payload);
        let response = BusResponse::reply(
            &request.request_id,
            MessageType::Command,
            200,
            "ok",
            serde_json::to_value(&reply)?,
        );
        self.bus.publish_response(&response).await
    }
}
