#![doc = r#"
# spark-tls-tunnel

## 设计动机（Why）
- **透明加密**：在任意 `Read + Write` 字节通道（TCP 套接字、内存管道）之上提供明文读写，
  握手、记录分片、重协商全部在隧道内部完成；
- **阻塞与非阻塞通用**：套接字返回 `WouldBlock` 时以返回值表达“暂时无法推进”，状态原样保留；
- **可替换引擎**：TLS 会话通过 [`TlsEngine`] 能力接口接入，默认实现 [`RustlsEngine`] 基于 rustls。

## 核心契约（What）
- [`TlsTunnel::initialize`]：绑定通道，经 [`EngineFactory`] 创建引擎、握手计划与四块缓冲；
- [`TlsTunnel::do_handshake`]：执行 [`HandshakePlan`]，客户端默认追加证书有效期校验；
- [`TlsTunnel::read`] / [`TlsTunnel::write`] / [`TlsTunnel::write_buffers`]：稳态明文收发；
- [`TlsTunnel::cleanup`]：拆除隧道，此后操作返回 [`TunnelError::EngineNotInitialized`]。

## 实现策略（How）
- 缓冲访问通过 `spark-buffer` 的作用域守卫完成，任何退出路径都会回收已读区域；
- 引擎报告目标空间不足时对应缓冲倍增后重试，数据不足时打下溢标记等待下一次读取；
- 证书有效期使用 `x509-parser` 解析 DER 后逐张比对。

## 风险与考量（Trade-offs）
- 隧道只供单一所有者使用，不做内部同步；
- 缓冲只增不减，单条超大记录会让相应缓冲在会话内保持较大容量。
"#]

mod buffers;
mod certificate;
mod engine;
mod error;
mod factory;
mod handshake;
mod options;
mod pump;
mod rustls_engine;
mod tunnel;

pub use buffers::BufferData;
pub use certificate::CertificateValidator;
pub use engine::{
    DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, Role, SessionSizes, TlsEngine,
};
pub use error::{TunnelError, TunnelErrorKind};
pub use factory::{EngineFactory, RustlsEngineFactory};
pub use handshake::{HandshakeOutcome, HandshakePlan, HandshakeStep};
pub use options::{OptionsError, TunnelOptions};
pub use rustls_engine::{MAX_FRAGMENT_LEN, MAX_PACKET_LEN, RustlsEngine};
pub use tunnel::{ReadOutcome, TlsTunnel};
