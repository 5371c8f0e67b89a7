//! TLS 会话引擎能力契约。
//!
//! 隧道不关心密钥交换与加密原语，只通过 [`TlsEngine`] 驱动 wrap/unwrap、
//! 查询握手状态并执行委托任务。任何提供等价语义的 TLS 库都可以实现该 trait，
//! 仓库自带的实现见 [`RustlsEngine`](crate::RustlsEngine)。

use rustls_pki_types::CertificateDer;

use crate::error::TunnelError;

/// 引擎在会话中扮演的角色。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// 引擎报告的握手状态。
///
/// `Finished` 与 `NotHandshaking` 为终态；其余状态在稳态下出现即表示进入重协商。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum HandshakeStatus {
    NotStarted,
    NeedWrap,
    NeedUnwrap,
    NeedTask,
    Finished,
    NotHandshaking,
}

impl HandshakeStatus {
    /// 握手是否已到达终态。
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeStatus::Finished | HandshakeStatus::NotHandshaking)
    }
}

/// 单次 wrap/unwrap 的结果状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EngineStatus {
    Ok,
    /// 会话已关闭：出站方向已发出 close-notify，或入站方向收到了 close-notify。
    Closed,
    /// 目标缓冲空间不足。
    BufferOverflow,
    /// 源缓冲不足以构成完整记录。
    BufferUnderflow,
}

/// 单次变换的产出，调用方必须立即消费。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub consumed: usize,
    pub produced: usize,
}

impl EngineResult {
    pub fn new(status: EngineStatus, consumed: usize, produced: usize) -> Self {
        Self {
            status,
            consumed,
            produced,
        }
    }

    /// 本次变换是否推进了任一侧游标。
    pub fn made_progress(&self) -> bool {
        self.consumed > 0 || self.produced > 0
    }
}

/// 引擎协商出的缓冲尺寸上限。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionSizes {
    /// 单条记录可承载的最大明文字节数。
    pub application_buffer_size: usize,
    /// 单条记录在线路上的最大密文字节数。
    pub packet_buffer_size: usize,
}

/// 引擎要求调用方同步执行的计算（例如密钥协商）。
pub type DelegatedTask = Box<dyn FnOnce() + Send + 'static>;

/// TLS 会话引擎能力。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“平台 TLS 引擎”建模为能力接口，使隧道状态机可以在真实 rustls 会话与
///   测试用的确定性引擎之间切换；
///
/// ## 契约（What）
/// - `wrap`：从 `src` 读取明文、向 `dst` 写出密文；返回值中的 `consumed` 不得超过
///   `src.len()`，`produced` 不得超过 `dst.len()`；
/// - `unwrap`：从 `src` 读取密文、向 `dst` 写出明文；源数据不足时返回
///   [`EngineStatus::BufferUnderflow`]，目标空间不足时返回 [`EngineStatus::BufferOverflow`]；
/// - `handshake_status`：只读查询，可在任意时刻调用；
/// - `delegated_task`：逐个取出待执行任务，返回 `None` 表示已耗尽；
/// - `buffered_plaintext`：引擎内部已解密但尚未交给调用方的字节数，
///   隧道据此判断是否需要读取套接字。
///
/// ## 风险与权衡（Trade-offs）
/// - 错误统一以 [`TunnelError`] 返回，引擎实现需自行选择 `Tls` 或 `Engine` 变体。
pub trait TlsEngine {
    /// 显式开始握手；对已在构造时排队首个握手消息的引擎可以是空操作。
    fn begin_handshake(&mut self) -> Result<(), TunnelError>;

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TunnelError>;

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TunnelError>;

    fn handshake_status(&self) -> HandshakeStatus;

    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    /// 对端证书链；会话不可验证或对端未提供时为 `None`。
    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]>;

    /// 关闭出站方向；下一次 `wrap` 将产出 close-notify。
    fn close_outbound(&mut self);

    fn session_sizes(&self) -> SessionSizes;

    fn buffered_plaintext(&self) -> usize;

    /// 协商出的协议版本名，握手完成前为 `None`。
    fn protocol_version(&self) -> Option<String>;

    fn role(&self) -> Role;
}
