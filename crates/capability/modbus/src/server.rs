//! Modbus 服务端：功能码分发与 TCP/RTU 监听循环。

use crate::config::{ModbusServerConfig, RtuServerConfig, TransportConfig};
use crate::convert::{ByteOrder, ValueConverter};
use crate::error::{ExceptionCode, ModbusError};
use crate::frame::{build_rtu_frame, parse_rtu_frame, MbapHeader, MAX_PDU_LEN, MBAP_HEADER_LEN};
use crate::reader::RegisterReader;
use gw_mapping::MappingService;
use gw_telemetry::{record_modbus_exception, record_modbus_request};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

/// 请求 PDU 处理器：与传输无关的功能码语义。
pub struct RequestProcessor {
    mappings: Arc<MappingService>,
    reader: RegisterReader,
}

impl RequestProcessor {
    pub fn new(mappings: Arc<MappingService>, byte_order: ByteOrder) -> Self {
        let reader = RegisterReader::new(Arc::clone(&mappings), ValueConverter::new(byte_order));
        Self { mappings, reader }
    }

    /// 处理请求 PDU（功能码 + 数据），返回响应 PDU；空 PDU 视为坏帧。
    pub fn process(&self, pdu: &[u8]) -> Option<Vec<u8>> {
        let (&function_code, data) = pdu.split_first()?;
        record_modbus_request();

        let result = match function_code {
            0x01 | 0x02 => self.handle_read_bits(data),
            0x03 | 0x04 => self.handle_read_registers(data),
            0x05 => self.handle_write_single_coil(data),
            0x06 => self.handle_write_single_register(data),
            0x0F => self.handle_write_multiple_coils(data),
            0x10 => self.handle_write_multiple_registers(data),
            other => {
                warn!(target: "gw.modbus", function_code = other, "unsupported function code");
                Err(ExceptionCode::IllegalFunction)
            }
        };

        match result {
            Ok(mut body) => {
                let mut response = Vec::with_capacity(1 + body.len());
                response.push(function_code);
                response.append(&mut body);
                Some(response)
            }
            Err(code) => {
                record_modbus_exception();
                Some(vec![function_code | 0x80, code.as_u8()])
            }
        }
    }

    /// 0x01 读线圈 / 0x02 读离散输入。
    fn handle_read_bits(&self, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
        let (start, quantity) = parse_read_request(data, 1, 2000)?;
        debug!(target: "gw.modbus", start, quantity, "read bits");

        let outcome = self.reader.read_bits(start, quantity).map_err(|err| {
            error!(target: "gw.modbus", "bit read failed: {}", err);
            ExceptionCode::ServerDeviceFailure
        })?;
        self.mappings.log_data_forward(outcome.forwarded);
        Ok(outcome.data)
    }

    /// 0x03 读保持寄存器 / 0x04 读输入寄存器。
    fn handle_read_registers(&self, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
        let (start, quantity) = parse_read_request(data, 1, 125)?;
        debug!(target: "gw.modbus", start, quantity, "read registers");

        let outcome = self.reader.read_registers(start, quantity).map_err(|err| {
            error!(target: "gw.modbus", "register read failed: {}", err);
            ExceptionCode::ServerDeviceFailure
        })?;
        self.mappings.log_data_forward(outcome.forwarded);
        Ok(outcome.data)
    }

    /// 0x05 写单个线圈：值只允许 0x0000/0xFF00，校验写权限后回显。
    fn handle_write_single_coil(&self, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
        if data.len() < 4 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let address = u16::from_be_bytes([data[0], data[1]]);
        let value = u16::from_be_bytes([data[2], data[3]]);
        if value != 0x0000 && value != 0xFF00 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        debug!(target: "gw.modbus", address, value, "write single coil");
        self.check_write_permission(address)?;

        // TODO: 南向写入尚未经总线下发，当前只做协议层回显。
        Ok(data[..4].to_vec())
    }

    /// 0x06 写单个寄存器：校验写权限后回显。
    fn handle_write_single_register(&self, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
        if data.len() < 4 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let address = u16::from_be_bytes([data[0], data[1]]);
        let value = u16::from_be_bytes([data[2], data[3]]);
        debug!(target: "gw.modbus", address, value, "write single register");
        self.check_write_permission(address)?;

        Ok(data[..4].to_vec())
    }

    /// 0x0F 写多个线圈：数量与字节数一致性校验，逐地址校验写权限，回显地址与数量。
    fn handle_write_multiple_coils(&self, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
        if data.len() < 5 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let start = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        let byte_count = data[4];

        if quantity < 1 || quantity > 1968 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        if u16::from(byte_count) != quantity.div_ceil(8) || data.len() < 5 + byte_count as usize {
            return Err(ExceptionCode::IllegalDataValue);
        }
        debug!(target: "gw.modbus", start, quantity, "write multiple coils");

        for i in 0..quantity {
            self.check_write_permission(start.wrapping_add(i))?;
        }

        Ok(data[..4].to_vec())
    }

    /// 0x10 写多个寄存器：回显地址与数量。
    fn handle_write_multiple_registers(&self, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
        if data.len() < 5 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let start = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        debug!(target: "gw.modbus", start, quantity, "write multiple registers");

        Ok(data[..4].to_vec())
    }

    /// 写权限检查：无映射或南向只读都拒绝。
    fn check_write_permission(&self, address: u16) -> Result<(), ExceptionCode> {
        let Some(binding) = self.mappings.mapping_by_address(address) else {
            warn!(target: "gw.modbus", address, "write to unmapped address rejected");
            return Err(ExceptionCode::IllegalDataAddress);
        };
        if let Some(south) = &binding.mapping.south_resource {
            if !south.read_write.is_writable() {
                warn!(target: "gw.modbus", address, "write to read-only address rejected");
                return Err(ExceptionCode::IllegalDataAddress);
            }
        }
        Ok(())
    }
}

fn parse_read_request(data: &[u8], min: u16, max: u16) -> Result<(u16, u16), ExceptionCode> {
    if data.len() < 4 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let start = u16::from_be_bytes([data[0], data[1]]);
    let quantity = u16::from_be_bytes([data[2], data[3]]);
    if quantity < min || quantity > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((start, quantity))
}

struct ServerTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Modbus 服务端。停止 -> 运行 -> 停止；重复启动报错，重复停止为空操作。
pub struct ModbusServer {
    config: ModbusServerConfig,
    processor: Arc<RequestProcessor>,
    running: AtomicBool,
    task: Mutex<Option<ServerTask>>,
    tcp_addr: Mutex<Option<SocketAddr>>,
}

impl ModbusServer {
    pub fn new(config: ModbusServerConfig, mappings: Arc<MappingService>) -> Self {
        Self {
            config,
            processor: Arc::new(RequestProcessor::new(mappings, ByteOrder::Big)),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
            tcp_addr: Mutex::new(None),
        }
    }

    /// 绑定监听端并启动服务循环。
    pub async fn start(&self) -> Result<(), ModbusError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ModbusError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = match &self.config.transport {
            TransportConfig::Tcp(tcp) => {
                let listener = match TcpListener::bind((tcp.host.as_str(), tcp.port)).await {
                    Ok(listener) => listener,
                    Err(err) => {
                        self.running.store(false, Ordering::SeqCst);
                        return Err(err.into());
                    }
                };
                let local = match listener.local_addr() {
                    Ok(local) => local,
                    Err(err) => {
                        self.running.store(false, Ordering::SeqCst);
                        return Err(err.into());
                    }
                };
                {
                    let mut slot = self.tcp_addr.lock().unwrap_or_else(|e| e.into_inner());
                    *slot = Some(local);
                }
                info!(target: "gw.modbus", %local, "modbus tcp server listening");
                let processor = Arc::clone(&self.processor);
                tokio::spawn(accept_loop(listener, processor, stop_rx))
            }
            TransportConfig::Rtu(rtu) => {
                let stream = match open_serial(rtu) {
                    Ok(stream) => stream,
                    Err(err) => {
                        self.running.store(false, Ordering::SeqCst);
                        return Err(err);
                    }
                };
                info!(target: "gw.modbus", device = %rtu.device, "modbus rtu server started");
                let processor = Arc::clone(&self.processor);
                let slave_id = self.config.slave_id;
                tokio::spawn(rtu_loop(stream, processor, slave_id, stop_rx))
            }
        };

        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(ServerTask {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    /// 停止监听并等待服务循环退出；在途请求自然完成。
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let task = {
            let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(task) = task {
            let _ = task.stop.send(true);
            let _ = task.handle.await;
        }
        {
            let mut slot = self.tcp_addr.lock().unwrap_or_else(|e| e.into_inner());
            *slot = None;
        }
        info!(target: "gw.modbus", "modbus server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// TCP 模式下实际绑定的地址（端口 0 时由系统分配）。
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        *self.tcp_addr.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn accept_loop(
    listener: TcpListener,
    processor: Arc<RequestProcessor>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                info!(target: "gw.modbus", "accept loop stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(target: "gw.modbus", %peer, "modbus client connected");
                    let processor = Arc::clone(&processor);
                    let conn_stop = stop_rx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_tcp_connection(stream, processor, conn_stop).await {
                            warn!(target: "gw.modbus", %peer, "connection error: {}", err);
                        }
                        debug!(target: "gw.modbus", %peer, "modbus client disconnected");
                    });
                }
                Err(err) => {
                    error!(target: "gw.modbus", "accept failed: {}", err);
                }
            }
        }
    }
}

async fn serve_tcp_connection(
    mut stream: TcpStream,
    processor: Arc<RequestProcessor>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), ModbusError> {
    let mut header = [0u8; MBAP_HEADER_LEN];
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            read = stream.read_exact(&mut header) => {
                match read {
                    Ok(_) => {}
                    Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
                    Err(err) => return Err(err.into()),
                }
                let mbap = MbapHeader::parse(&header);
                let pdu_len = (mbap.length as usize).saturating_sub(1);
                if pdu_len == 0 {
                    return Err(ModbusError::ShortFrame(mbap.length as usize));
                }
                if pdu_len > MAX_PDU_LEN {
                    return Err(ModbusError::OversizedFrame(pdu_len));
                }
                let mut pdu = vec![0u8; pdu_len];
                stream.read_exact(&mut pdu).await?;

                // unit id 不校验，原样回显。
                let Some(response) = processor.process(&pdu) else { break };
                let mut out = Vec::with_capacity(MBAP_HEADER_LEN + response.len());
                out.extend_from_slice(&mbap.reply(response.len()).encode());
                out.extend_from_slice(&response);
                stream.write_all(&out).await?;
            }
        }
    }
    Ok(())
}

async fn rtu_loop(
    mut stream: SerialStream,
    processor: Arc<RequestProcessor>,
    slave_id: u8,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                info!(target: "gw.modbus", "rtu loop stopped");
                break;
            }
            frame = read_rtu_request(&mut stream) => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        error!(target: "gw.modbus", "serial read failed: {}", err);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let (unit, pdu) = match parse_rtu_frame(&frame) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(target: "gw.modbus", "bad rtu frame: {}", err);
                        continue;
                    }
                };
                // 从站号不匹配的帧不处理；0 为广播。
                if unit != slave_id && unit != 0 {
                    debug!(target: "gw.modbus", unit, "frame for other unit ignored");
                    continue;
                }
                let Some(response) = processor.process(pdu) else { continue };
                if unit == 0 {
                    continue;
                }
                let out = build_rtu_frame(unit, &response);
                if let Err(err) = stream.write_all(&out).await {
                    error!(target: "gw.modbus", "serial write failed: {}", err);
                    break;
                }
            }
        }
    }
}

/// 读一帧 RTU 请求。帧长只对支持的功能码可知，其余按最短帧读入、靠 CRC 拦下。
async fn read_rtu_request(stream: &mut SerialStream) -> Result<Vec<u8>, ModbusError> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let function_code = head[1];
    let mut frame = head.to_vec();

    match function_code {
        0x01..=0x06 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await?;
            frame.extend_from_slice(&rest);
        }
        0x0F | 0x10 => {
            let mut fixed = [0u8; 5];
            stream.read_exact(&mut fixed).await?;
            frame.extend_from_slice(&fixed);
            let byte_count = fixed[4] as usize;
            if byte_count > MAX_PDU_LEN {
                return Err(ModbusError::OversizedFrame(byte_count));
            }
            let mut rest = vec![0u8; byte_count + 2];
            stream.read_exact(&mut rest).await?;
            frame.extend_from_slice(&rest);
        }
        _ => {
            let mut rest = [0u8; 2];
            stream.read_exact(&mut rest).await?;
            frame.extend_from_slice(&rest);
        }
    }
    Ok(frame)
}

fn open_serial(config: &RtuServerConfig) -> Result<SerialStream, ModbusError> {
    let builder = tokio_serial::new(&config.device, config.baud_rate)
        .data_bits(serial_data_bits(config.data_bits)?)
        .parity(serial_parity(&config.parity)?)
        .stop_bits(serial_stop_bits(config.stop_bits)?)
        .timeout(Duration::from_millis(config.timeout_ms));
    Ok(builder.open_native_async()?)
}

fn serial_data_bits(bits: u8) -> Result<tokio_serial::DataBits, ModbusError> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(ModbusError::SerialParameter(
            "data_bits",
            other.to_string(),
        )),
    }
}

fn serial_parity(parity: &str) -> Result<tokio_serial::Parity, ModbusError> {
    match parity.to_ascii_uppercase().as_str() {
        "N" => Ok(tokio_serial::Parity::None),
        "E" => Ok(tokio_serial::Parity::Even),
        "O" => Ok(tokio_serial::Parity::Odd),
        other => Err(ModbusError::SerialParameter("parity", other.to_string())),
    }
}

fn serial_stop_bits(bits: u8) -> Result<tokio_serial::StopBits, ModbusError> {
    match bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        other => Err(ModbusError::SerialParameter(
            "stop_bits",
            other.to_string(),
        )),
    }
}
