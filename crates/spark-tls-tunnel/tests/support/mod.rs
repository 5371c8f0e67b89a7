//! 集成测试共享设施。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：为隧道状态机提供完全确定的运行环境：内存管道代替套接字，
//!   分帧引擎代替真实 TLS，使下溢、溢出、背压、委托任务与重协商都能被精确触发；
//! - **结构说明 (How)**：
//!   - [`MemoryPipe`]：单线程双向管道，空队列返回 `WouldBlock`，可限制单次读取长度与写入预算；
//!   - [`FramingEngine`]：以 `[类型 u8][长度 u16][载荷]` 为记录格式的确定性引擎；
//!   - rcgen 证书与 rustls 配置助手，覆盖有效、过期、尚未生效三种证书；
//! - **契约 (What)**：所有助手只在测试中使用，失败时直接 panic 并给出中文说明。

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io::{self, Read, Write},
    rc::Rc,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use spark_tls_tunnel::{
    DelegatedTask, EngineFactory, EngineResult, EngineStatus, HandshakeOutcome, HandshakePlan,
    HandshakeStatus, ReadOutcome, Role, SessionSizes, TlsEngine, TlsTunnel, TunnelError,
    TunnelOptions,
};

// ---------------------------------------------------------------------------
// 内存管道
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Lane {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// 单线程内存管道的一端。
pub struct MemoryPipe {
    inbound: Rc<RefCell<Lane>>,
    outbound: Rc<RefCell<Lane>>,
    read_chunk: Cell<usize>,
    write_budget: Cell<Option<usize>>,
    write_broken: Cell<bool>,
    read_calls: Cell<usize>,
}

/// 创建一对相互连接的管道端点。
pub fn pipe_pair() -> (MemoryPipe, MemoryPipe) {
    let a_to_b = Rc::new(RefCell::new(Lane::default()));
    let b_to_a = Rc::new(RefCell::new(Lane::default()));
    (
        MemoryPipe::new(Rc::clone(&b_to_a), Rc::clone(&a_to_b)),
        MemoryPipe::new(a_to_b, b_to_a),
    )
}

impl MemoryPipe {
    fn new(inbound: Rc<RefCell<Lane>>, outbound: Rc<RefCell<Lane>>) -> Self {
        Self {
            inbound,
            outbound,
            read_chunk: Cell::new(usize::MAX),
            write_budget: Cell::new(None),
            write_broken: Cell::new(false),
            read_calls: Cell::new(0),
        }
    }

    /// 限制单次 `read` 最多返回的字节数。
    pub fn set_read_chunk(&self, chunk: usize) {
        self.read_chunk.set(chunk.max(1));
    }

    /// 限制后续写入的总字节数；`None` 表示不限。预算耗尽后写入返回 `WouldBlock`。
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.write_budget.set(budget);
    }

    /// 之后的每次写入都以 `BrokenPipe` 失败。
    pub fn break_writes(&self) {
        self.write_broken.set(true);
    }

    /// 对本端 `read` 的调用次数（含 `WouldBlock`）。
    pub fn read_calls(&self) -> usize {
        self.read_calls.get()
    }

    /// 对端尚未读取的字节数。
    pub fn pending_outbound(&self) -> usize {
        self.outbound.borrow().bytes.len()
    }

    /// 直接向本端的入站队列注入原始字节。
    pub fn inject_inbound(&self, bytes: &[u8]) {
        self.inbound.borrow_mut().bytes.extend(bytes.iter().copied());
    }

    /// 关闭写方向；对端读空队列后得到流结束。
    pub fn close_write(&self) {
        self.outbound.borrow_mut().closed = true;
    }
}

impl Read for MemoryPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_calls.set(self.read_calls.get() + 1);
        let mut lane = self.inbound.borrow_mut();
        if lane.bytes.is_empty() {
            return if lane.closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let len = buf.len().min(lane.bytes.len()).min(self.read_chunk.get());
        for (slot, byte) in buf.iter_mut().zip(lane.bytes.drain(..len)) {
            *slot = byte;
        }
        Ok(len)
    }
}

impl Write for MemoryPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.write_broken.get() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let len = match self.write_budget.get() {
            Some(0) if !buf.is_empty() => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => {
                let len = budget.min(buf.len());
                self.write_budget.set(Some(budget - len));
                len
            }
            None => buf.len(),
        };
        self.outbound
            .borrow_mut()
            .bytes
            .extend(buf[..len].iter().copied());
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 分帧引擎
// ---------------------------------------------------------------------------

pub const RECORD_HEADER: usize = 3;
pub const KIND_HANDSHAKE: u8 = 0x16;
pub const KIND_DATA: u8 = 0x17;
pub const KIND_CLOSE: u8 = 0x15;
const MASK: u8 = 0x5a;

pub const CLIENT_HELLO: &[u8] = b"CH";
pub const SERVER_HELLO: &[u8] = b"SH";
pub const HELLO_REQUEST: &[u8] = b"HR";

/// 以分帧引擎的格式编码一条记录。
pub fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let len = u16::try_from(payload.len()).expect("测试记录长度必须小于 64KiB");
    let mut record = Vec::with_capacity(RECORD_HEADER + payload.len());
    record.push(kind);
    record.extend_from_slice(&len.to_be_bytes());
    if kind == KIND_DATA {
        record.extend(payload.iter().map(|byte| byte ^ MASK));
    } else {
        record.extend_from_slice(payload);
    }
    record
}

/// 分帧引擎的可调参数。
#[derive(Clone, Debug)]
pub struct FramingConfig {
    /// 本端声明的明文尺寸（决定隧道缓冲初始容量与快路径阈值）。
    pub application_buffer_size: usize,
    /// 本端单条数据记录最多承载的明文字节数。
    pub max_record: usize,
    /// 握手中是否插入一次委托任务。
    pub with_task: bool,
    /// 产出第 N 条数据记录后报告出站关闭。
    pub close_after_records: Option<usize>,
    /// 已执行的委托任务计数。
    pub tasks_run: Arc<AtomicUsize>,
}

impl FramingConfig {
    pub fn new(application_buffer_size: usize) -> Self {
        Self {
            application_buffer_size,
            max_record: application_buffer_size,
            with_task: false,
            close_after_records: None,
            tasks_run: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Idle,
    SendHello,
    AwaitHello,
    ReplyHello,
    Task(AfterTask),
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AfterTask {
    Reply,
    Done,
}

/// 确定性的分帧“TLS”引擎。
///
/// 握手：客户端发送 `CH`，服务端回复 `SH`；可选地在收到 hello 后要求一次委托任务。
/// 稳态收到 `HR` 的客户端重新发送 `CH`，收到 `CH` 的服务端重新回复 `SH`。
pub struct FramingEngine {
    role: Role,
    config: FramingConfig,
    phase: Phase,
    task_done: Arc<AtomicBool>,
    task_handed_out: bool,
    records_sent: usize,
    close_requested: bool,
    close_sent: bool,
    peer_closed: bool,
    negotiated: bool,
}

impl FramingEngine {
    pub fn new(role: Role, config: FramingConfig) -> Self {
        Self {
            role,
            config,
            phase: Phase::Idle,
            task_done: Arc::new(AtomicBool::new(false)),
            task_handed_out: false,
            records_sent: 0,
            close_requested: false,
            close_sent: false,
            peer_closed: false,
            negotiated: false,
        }
    }

    fn settle(&mut self) {
        if let Phase::Task(after) = self.phase {
            if self.task_done.load(Ordering::SeqCst) {
                self.phase = match after {
                    AfterTask::Reply => Phase::ReplyHello,
                    AfterTask::Done => self.finish(),
                };
            }
        }
    }

    fn finish(&mut self) -> Phase {
        self.negotiated = true;
        Phase::Done
    }

    fn after_hello(&mut self, after: AfterTask) -> Phase {
        if self.config.with_task {
            self.task_done.store(false, Ordering::SeqCst);
            self.task_handed_out = false;
            Phase::Task(after)
        } else {
            match after {
                AfterTask::Reply => Phase::ReplyHello,
                AfterTask::Done => self.finish(),
            }
        }
    }

    fn emit(dst: &mut [u8], kind: u8, payload: &[u8]) -> Option<usize> {
        let record = frame(kind, payload);
        let target = dst.get_mut(..record.len())?;
        target.copy_from_slice(&record);
        Some(record.len())
    }

    fn unexpected(&self, what: &str) -> TunnelError {
        TunnelError::Engine {
            detail: format!("{:?} engine in phase {:?} got {what}", self.role, self.phase),
        }
    }
}

impl TlsEngine for FramingEngine {
    fn begin_handshake(&mut self) -> Result<(), TunnelError> {
        self.phase = match self.role {
            Role::Client => Phase::SendHello,
            Role::Server => Phase::AwaitHello,
        };
        Ok(())
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TunnelError> {
        self.settle();
        if self.close_sent {
            return Ok(EngineResult::new(EngineStatus::Closed, 0, 0));
        }
        if self.close_requested {
            return Ok(match Self::emit(dst, KIND_CLOSE, &[]) {
                Some(produced) => {
                    self.close_sent = true;
                    EngineResult::new(EngineStatus::Closed, 0, produced)
                }
                None => EngineResult::new(EngineStatus::BufferOverflow, 0, 0),
            });
        }

        let hello = match self.phase {
            Phase::SendHello => Some((CLIENT_HELLO, Phase::AwaitHello)),
            Phase::ReplyHello => Some((SERVER_HELLO, Phase::Done)),
            _ => None,
        };
        if let Some((payload, next)) = hello {
            return Ok(match Self::emit(dst, KIND_HANDSHAKE, payload) {
                Some(produced) => {
                    self.phase = if next == Phase::Done { self.finish() } else { next };
                    EngineResult::new(EngineStatus::Ok, 0, produced)
                }
                None => EngineResult::new(EngineStatus::BufferOverflow, 0, 0),
            });
        }

        if self.phase != Phase::Done || src.is_empty() {
            return Ok(EngineResult::new(EngineStatus::Ok, 0, 0));
        }

        let take = src.len().min(self.config.max_record);
        let Some(produced) = Self::emit(dst, KIND_DATA, &src[..take]) else {
            return Ok(EngineResult::new(EngineStatus::BufferOverflow, 0, 0));
        };
        self.records_sent += 1;
        let status = match self.config.close_after_records {
            Some(limit) if self.records_sent >= limit => {
                self.close_sent = true;
                EngineStatus::Closed
            }
            _ => EngineStatus::Ok,
        };
        Ok(EngineResult::new(status, take, produced))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TunnelError> {
        self.settle();
        if src.len() < RECORD_HEADER {
            let status = if self.peer_closed && src.is_empty() {
                EngineStatus::Closed
            } else {
                EngineStatus::BufferUnderflow
            };
            return Ok(EngineResult::new(status, 0, 0));
        }
        let kind = src[0];
        let len = usize::from(u16::from_be_bytes([src[1], src[2]]));
        let total = RECORD_HEADER + len;
        if src.len() < total {
            return Ok(EngineResult::new(EngineStatus::BufferUnderflow, 0, 0));
        }
        let payload = &src[RECORD_HEADER..total];

        match kind {
            KIND_DATA => {
                let Some(out) = dst.get_mut(..len) else {
                    return Ok(EngineResult::new(EngineStatus::BufferOverflow, 0, 0));
                };
                for (slot, byte) in out.iter_mut().zip(payload) {
                    *slot = byte ^ MASK;
                }
                Ok(EngineResult::new(EngineStatus::Ok, total, len))
            }
            KIND_CLOSE => {
                self.peer_closed = true;
                Ok(EngineResult::new(EngineStatus::Closed, total, 0))
            }
            KIND_HANDSHAKE => {
                self.phase = match (self.role, self.phase, payload) {
                    (Role::Server, Phase::AwaitHello | Phase::Done, CLIENT_HELLO) => {
                        self.after_hello(AfterTask::Reply)
                    }
                    (Role::Client, Phase::AwaitHello, SERVER_HELLO) => {
                        self.after_hello(AfterTask::Done)
                    }
                    (Role::Client, Phase::Done, HELLO_REQUEST) => Phase::SendHello,
                    _ => return Err(self.unexpected("handshake record")),
                };
                Ok(EngineResult::new(EngineStatus::Ok, total, 0))
            }
            other => Err(self.unexpected(&format!("record kind {other:#04x}"))),
        }
    }

    fn handshake_status(&self) -> HandshakeStatus {
        match self.phase {
            Phase::Idle => HandshakeStatus::NotStarted,
            Phase::SendHello | Phase::ReplyHello => HandshakeStatus::NeedWrap,
            Phase::AwaitHello => HandshakeStatus::NeedUnwrap,
            Phase::Task(after) if self.task_done.load(Ordering::SeqCst) => match after {
                AfterTask::Reply => HandshakeStatus::NeedWrap,
                AfterTask::Done => HandshakeStatus::Finished,
            },
            Phase::Task(_) => HandshakeStatus::NeedTask,
            Phase::Done => HandshakeStatus::NotHandshaking,
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        if !matches!(self.phase, Phase::Task(_)) || self.task_handed_out {
            return None;
        }
        self.task_handed_out = true;
        let done = Arc::clone(&self.task_done);
        let counter = Arc::clone(&self.config.tasks_run);
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            done.store(true, Ordering::SeqCst);
        }))
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        None
    }

    fn close_outbound(&mut self) {
        self.close_requested = true;
    }

    fn session_sizes(&self) -> SessionSizes {
        SessionSizes {
            application_buffer_size: self.config.application_buffer_size,
            packet_buffer_size: self.config.application_buffer_size + RECORD_HEADER,
        }
    }

    fn buffered_plaintext(&self) -> usize {
        0
    }

    fn protocol_version(&self) -> Option<String> {
        let finished = self.handshake_status() == HandshakeStatus::Finished;
        (self.negotiated || finished).then(|| "FRAMING/1".to_string())
    }

    fn role(&self) -> Role {
        self.role
    }
}

/// 分帧引擎工厂。
pub struct FramingFactory {
    pub role: Role,
    pub config: FramingConfig,
    pub options: TunnelOptions,
}

impl FramingFactory {
    pub fn new(role: Role, config: FramingConfig) -> Self {
        Self {
            role,
            config,
            options: TunnelOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TunnelOptions) -> Self {
        self.options = options;
        self
    }
}

impl EngineFactory for FramingFactory {
    type Engine = FramingEngine;

    fn create_engine(&self) -> Result<FramingEngine, TunnelError> {
        Ok(FramingEngine::new(self.role, self.config.clone()))
    }

    fn handshake_plan(&self) -> HandshakePlan {
        HandshakePlan::negotiate()
    }

    fn options(&self) -> &TunnelOptions {
        &self.options
    }
}

pub type FramingTunnel = TlsTunnel<MemoryPipe, FramingEngine>;

/// 基于内存管道创建一对分帧隧道并完成握手。
pub fn framing_pair(
    client_factory: FramingFactory,
    server_factory: FramingFactory,
) -> (FramingTunnel, FramingTunnel) {
    let (client_pipe, server_pipe) = pipe_pair();
    let mut client =
        TlsTunnel::initialize(client_pipe, &client_factory).expect("客户端隧道初始化");
    let mut server =
        TlsTunnel::initialize(server_pipe, &server_factory).expect("服务端隧道初始化");
    complete_handshake(&mut client, &mut server);
    (client, server)
}

/// 交替驱动两端握手直至双方完成。
pub fn complete_handshake<S, E>(client: &mut TlsTunnel<S, E>, server: &mut TlsTunnel<S, E>)
where
    S: Read + Write,
    E: TlsEngine,
{
    let mut client_done = false;
    let mut server_done = false;
    for _ in 0..64 {
        if !client_done {
            client_done = client.do_handshake().expect("客户端握手") == HandshakeOutcome::Finished;
        }
        if !server_done {
            server_done = server.do_handshake().expect("服务端握手") == HandshakeOutcome::Finished;
        }
        if client_done && server_done {
            return;
        }
    }
    panic!("握手在 64 轮内未收敛");
}

/// 持续读取直到累计 `expected` 字节或达到轮数上限。
pub fn read_exactly<S, E>(tunnel: &mut TlsTunnel<S, E>, expected: usize, chunk: usize) -> Vec<u8>
where
    S: Read + Write,
    E: TlsEngine,
{
    let mut collected = Vec::with_capacity(expected);
    let mut buf = vec![0u8; chunk.max(1)];
    for _ in 0..(expected * 4 + 64) {
        if collected.len() >= expected {
            break;
        }
        match tunnel.read(&mut buf).expect("读取明文") {
            ReadOutcome::Data(n) => collected.extend_from_slice(&buf[..n]),
            ReadOutcome::Closed => break,
            ReadOutcome::BufferOverflow => panic!("{chunk} 字节的读取缓冲触发了溢出哨兵"),
        }
    }
    collected
}

// ---------------------------------------------------------------------------
// rustls 助手
// ---------------------------------------------------------------------------

/// 安装 ring 作为进程级默认加密后端；重复调用安全。
pub fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // 其它测试线程可能已经安装，忽略“已存在”的错误。
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// 证书有效期窗口。
#[derive(Clone, Copy, Debug)]
pub enum Validity {
    Current,
    Expired,
    NotYetValid,
}

/// 生成 `localhost` 的自签名证书，返回证书与 PKCS#8 私钥。
pub fn self_signed(validity: Validity) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, date_time_ymd};

    let mut params =
        CertificateParams::new(vec!["localhost".to_string()]).expect("构造证书参数失败");
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "localhost");
    params.distinguished_name = dn;
    match validity {
        Validity::Current => {}
        Validity::Expired => {
            params.not_before = date_time_ymd(2000, 1, 1);
            params.not_after = date_time_ymd(2001, 1, 1);
        }
        Validity::NotYetValid => {
            params.not_before = date_time_ymd(2099, 1, 1);
            params.not_after = date_time_ymd(2100, 1, 1);
        }
    }

    let key_pair = KeyPair::generate().expect("生成证书私钥失败");
    let certificate = params.self_signed(&key_pair).expect("签发自签名证书失败");
    let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
    (certificate.der().clone(), PrivateKeyDer::Pkcs8(key))
}

pub fn server_config(cert: CertificateDer<'static>, key: PrivateKeyDer<'static>) -> Arc<ServerConfig> {
    ensure_crypto_provider();
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .expect("构建服务端 TLS 配置失败");
    Arc::new(config)
}

/// 只信任给定证书的客户端配置。
pub fn trusting_client_config(cert: &CertificateDer<'static>) -> Arc<ClientConfig> {
    ensure_crypto_provider();
    let mut roots = RootCertStore::empty();
    roots.add(cert.clone()).expect("将证书写入 Root Store 失败");
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

/// 接受任意服务端证书的客户端配置，用于验证隧道自身的有效期校验。
pub fn accept_any_client_config() -> Arc<ClientConfig> {
    ensure_crypto_provider();
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    Arc::new(config)
}

pub fn localhost() -> ServerName<'static> {
    ServerName::try_from("localhost").expect("合法主机名")
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
