use std::{
    fmt,
    io::{Read, Write},
    sync::Arc,
};

use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use rustls_pki_types::{CertificateDer, ServerName};
use tracing::trace;

use crate::{
    engine::{
        DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, Role, SessionSizes, TlsEngine,
    },
    error::TunnelError,
};

/// 单条 TLS 记录的最大明文长度（2^14）。
pub const MAX_FRAGMENT_LEN: usize = 16 * 1024;

/// 单条 TLS 记录在线路上的最大长度：5 字节记录头 + 2^14 明文 + 2048 字节密文扩展。
pub const MAX_PACKET_LEN: usize = 5 + MAX_FRAGMENT_LEN + 2048;

enum Session {
    Client(ClientConnection),
    Server(ServerConnection),
}

macro_rules! with_session {
    ($session:expr, $conn:ident => $body:expr) => {
        match $session {
            Session::Client($conn) => $body,
            Session::Server($conn) => $body,
        }
    };
}

/// 基于 rustls 缓冲式连接的 [`TlsEngine`] 实现。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - rustls 不提供 SSLEngine 式的“切片进、切片出”接口，而是通过 `read_tls`/`write_tls`
///   与内部明文队列交换数据；本类型把两者对齐为 wrap/unwrap 语义，使隧道状态机保持引擎无关。
///
/// ## 逻辑（How）
/// - `wrap`：稳态下把至多一条记录的明文交给 `writer()`，随后以 `write_tls` 把排队密文写入 `dst`；
/// - `unwrap`：先交付引擎中残留的明文，没有残留时才把 `src` 交给 `read_tls` 并
///   `process_new_packets`，最后把新明文读入 `dst`；
/// - 握手状态由 `is_handshaking` 与 `wants_write` 推导：握手结束后若仍有待发密文
///   （客户端 Finished、服务端会话票据）继续报告 `NeedWrap`，确保这些字节被冲刷。
///
/// ## 契约（What）
/// - 从不产生委托任务；
/// - `read_tls` 只会收到非空切片，避免被 rustls 误判为流结束；
/// - 收到对端 close-notify 且无残留明文时，`unwrap` 报告 [`EngineStatus::Closed`]。
///
/// ## 风险与权衡（Trade-offs）
/// - rustls 会吸收不完整记录，因而“下溢”只在源切片为空时出现；隧道的下溢处理仍然适用；
/// - 每次变换都经过 `Read`/`Write` 适配，存在一次额外拷贝。
pub struct RustlsEngine {
    session: Session,
    pending_plaintext: usize,
    outbound_closed: bool,
}

impl RustlsEngine {
    /// 以客户端身份创建会话，首个 ClientHello 在构造时即进入发送队列。
    pub fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self, TunnelError> {
        let connection = ClientConnection::new(config, server_name)?;
        Ok(Self::from_session(Session::Client(connection)))
    }

    /// 以服务端身份创建会话。
    pub fn server(config: Arc<ServerConfig>) -> Result<Self, TunnelError> {
        let connection = ServerConnection::new(config)?;
        Ok(Self::from_session(Session::Server(connection)))
    }

    fn from_session(session: Session) -> Self {
        Self {
            session,
            pending_plaintext: 0,
            outbound_closed: false,
        }
    }

    fn is_handshaking(&self) -> bool {
        with_session!(&self.session, conn => conn.is_handshaking())
    }

    fn wants_write(&self) -> bool {
        with_session!(&self.session, conn => conn.wants_write())
    }

    fn accept_plaintext(&mut self, src: &[u8]) -> Result<usize, TunnelError> {
        let accepted = &src[..src.len().min(MAX_FRAGMENT_LEN)];
        with_session!(&mut self.session, conn => conn.writer().write(accepted))
            .map_err(|source| TunnelError::io("wrap", source))
    }

    fn emit_ciphertext(&mut self, dst: &mut [u8]) -> Result<usize, TunnelError> {
        let mut produced = 0;
        while self.wants_write() && produced < dst.len() {
            let mut out = &mut dst[produced..];
            let written = with_session!(&mut self.session, conn => conn.write_tls(&mut out))
                .map_err(|source| TunnelError::io("wrap", source))?;
            if written == 0 {
                break;
            }
            produced += written;
        }
        Ok(produced)
    }

    fn absorb_ciphertext(&mut self, src: &[u8]) -> Result<usize, TunnelError> {
        let mut reader = src;
        with_session!(&mut self.session, conn => conn.read_tls(&mut reader))
            .map_err(|source| TunnelError::io("unwrap", source))
    }

    fn deliver_plaintext(&mut self, dst: &mut [u8]) -> Result<usize, TunnelError> {
        let read = with_session!(&mut self.session, conn => conn.reader().read(dst))
            .map_err(|source| TunnelError::io("unwrap", source))?;
        self.pending_plaintext = self.pending_plaintext.saturating_sub(read);
        Ok(read)
    }
}

impl fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("role", &self.role())
            .field("handshake_status", &self.handshake_status())
            .field("pending_plaintext", &self.pending_plaintext)
            .field("outbound_closed", &self.outbound_closed)
            .finish_non_exhaustive()
    }
}

impl TlsEngine for RustlsEngine {
    fn begin_handshake(&mut self) -> Result<(), TunnelError> {
        Ok(())
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TunnelError> {
        let consumed = if !src.is_empty() && !self.outbound_closed && !self.is_handshaking() {
            self.accept_plaintext(src)?
        } else {
            0
        };

        if dst.is_empty() && self.wants_write() {
            return Ok(EngineResult::new(EngineStatus::BufferOverflow, consumed, 0));
        }

        let produced = self.emit_ciphertext(dst)?;
        let status = if self.outbound_closed && !self.wants_write() {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        trace!(consumed, produced, ?status, "rustls wrap");
        Ok(EngineResult::new(status, consumed, produced))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TunnelError> {
        let mut consumed = 0;
        let mut peer_closed = false;

        // 残留明文未交付前不再喂入密文，否则 rustls 的明文队列可能触顶。
        if self.pending_plaintext == 0 {
            if !src.is_empty() {
                consumed = self.absorb_ciphertext(src)?;
            }
            let state = with_session!(&mut self.session, conn => conn.process_new_packets())?;
            self.pending_plaintext = state.plaintext_bytes_to_read();
            peer_closed = state.peer_has_closed();
        }

        if self.pending_plaintext > 0 && dst.is_empty() {
            return Ok(EngineResult::new(EngineStatus::BufferOverflow, consumed, 0));
        }

        let produced = if self.pending_plaintext > 0 {
            self.deliver_plaintext(dst)?
        } else {
            0
        };

        let status = if consumed > 0 || produced > 0 {
            EngineStatus::Ok
        } else if peer_closed {
            EngineStatus::Closed
        } else {
            EngineStatus::BufferUnderflow
        };
        trace!(consumed, produced, ?status, "rustls unwrap");
        Ok(EngineResult::new(status, consumed, produced))
    }

    fn handshake_status(&self) -> HandshakeStatus {
        match (self.is_handshaking(), self.wants_write()) {
            (true, true) | (false, true) => HandshakeStatus::NeedWrap,
            (true, false) => HandshakeStatus::NeedUnwrap,
            (false, false) => HandshakeStatus::NotHandshaking,
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        with_session!(&self.session, conn => conn.peer_certificates())
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            with_session!(&mut self.session, conn => conn.send_close_notify());
            self.outbound_closed = true;
        }
    }

    fn session_sizes(&self) -> SessionSizes {
        SessionSizes {
            application_buffer_size: MAX_FRAGMENT_LEN,
            packet_buffer_size: MAX_PACKET_LEN,
        }
    }

    fn buffered_plaintext(&self) -> usize {
        self.pending_plaintext
    }

    fn protocol_version(&self) -> Option<String> {
        with_session!(&self.session, conn => conn.protocol_version())
            .map(|version| format!("{version:?}"))
    }

    fn role(&self) -> Role {
        match self.session {
            Session::Client(_) => Role::Client,
            Session::Server(_) => Role::Server,
        }
    }
}
