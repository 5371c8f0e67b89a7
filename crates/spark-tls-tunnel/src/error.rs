//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为隧道对外暴露的失败语义提供集中定义：传输致命、证书致命、调用时序错误与内部错误；
//! - 流控（下溢、调用方缓冲溢出）与背压不属于错误，它们以返回值形式出现，
//!   见 [`ReadOutcome`](crate::ReadOutcome) 与 [`HandshakeOutcome`](crate::HandshakeOutcome)。
//!
//! ## 设计要求（What）
//! - 所有变体实现 `thiserror::Error`，可直接 `?` 传播；
//! - [`TunnelError::kind`] 给出稳定分类，便于诊断与告警分组。

use std::io;

use thiserror::Error;

use crate::engine::HandshakeStatus;

/// 隧道错误的粗粒度分类。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TunnelErrorKind {
    /// 对端断开、会话意外关闭、硬写失败或 TLS 协议错误；隧道不可继续使用。
    TransportFatal,
    /// 客户端证书后置校验失败；同样终止隧道，但需要与传输故障区分。
    CertificateFatal,
    /// 调用时序错误，例如拆除后继续读写。
    Usage,
    /// 实现缺陷，例如握手循环中出现不应出现的状态。
    Internal,
}

/// TLS 隧道错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把引擎、套接字与证书校验的失败统一成带标签的枚举，
///   迫使调用方逐类处理，而不是依赖隐式传播；
/// - **契约 (What)**：除 [`TunnelErrorKind::Usage`] 外的错误出现后隧道已执行拆除；
/// - **设计权衡 (Trade-offs)**：证书主题以 `String` 保存，牺牲少量分配换取可读诊断。
#[derive(Debug, Error)]
pub enum TunnelError {
    /// 读取套接字时遇到流结束。
    #[error("peer disconnected during {operation}")]
    Disconnected { operation: &'static str },

    /// 套接字读写失败。
    #[error("socket I/O failed during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// rustls 报告的协议或证书链错误。
    #[error("TLS engine rejected the session: {0}")]
    Tls(#[from] rustls::Error),

    /// 其它引擎实现报告的失败。
    #[error("TLS engine failure: {detail}")]
    Engine { detail: String },

    /// 握手尚未结束时引擎报告会话已关闭。
    #[error("TLS session closed before the handshake completed")]
    SessionClosed,

    /// 对端未提供证书链，或会话无法给出可验证的链。
    #[error("peer presented no certificate chain")]
    MissingCertificate,

    /// 链中某张证书已过期。
    #[error("certificate #{index} ({subject}) expired at unix time {not_after}")]
    CertificateExpired {
        index: usize,
        subject: String,
        not_after: i64,
    },

    /// 链中某张证书尚未生效。
    #[error("certificate #{index} ({subject}) is not valid before unix time {not_before}")]
    CertificateNotYetValid {
        index: usize,
        subject: String,
        not_before: i64,
    },

    /// 证书 DER 无法解析。
    #[error("certificate #{index} could not be parsed: {detail}")]
    CertificateParse { index: usize, detail: String },

    /// 引擎尚未创建或已在拆除时释放。
    #[error("TLS engine is not initialized (operation: {operation})")]
    EngineNotInitialized { operation: &'static str },

    /// 协商结果在握手完成前被查询。
    #[error("TLS handshake has not negotiated a protocol version yet")]
    HandshakeIncomplete,

    /// 握手循环遇到无法处理的状态。
    #[error("unexpected handshake status {status:?} inside the handshake loop")]
    UnexpectedHandshakeStatus { status: HandshakeStatus },
}

impl TunnelError {
    /// 返回错误所属的稳定分类。
    pub fn kind(&self) -> TunnelErrorKind {
        match self {
            TunnelError::Disconnected { .. }
            | TunnelError::Io { .. }
            | TunnelError::Tls(_)
            | TunnelError::Engine { .. }
            | TunnelError::SessionClosed => TunnelErrorKind::TransportFatal,
            TunnelError::MissingCertificate
            | TunnelError::CertificateExpired { .. }
            | TunnelError::CertificateNotYetValid { .. }
            | TunnelError::CertificateParse { .. } => TunnelErrorKind::CertificateFatal,
            TunnelError::EngineNotInitialized { .. } | TunnelError::HandshakeIncomplete => {
                TunnelErrorKind::Usage
            }
            TunnelError::UnexpectedHandshakeStatus { .. } => TunnelErrorKind::Internal,
        }
    }

    /// 是否为证书后置校验失败。
    pub fn is_certificate_error(&self) -> bool {
        self.kind() == TunnelErrorKind::CertificateFatal
    }

    pub(crate) fn io(operation: &'static str, source: io::Error) -> Self {
        TunnelError::Io { operation, source }
    }
}
