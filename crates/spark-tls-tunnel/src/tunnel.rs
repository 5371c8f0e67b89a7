use std::io::{Read, Write};

use bytes::Buf;
use tracing::{debug, trace, warn};

use crate::{
    buffers::BufferData,
    engine::{EngineStatus, Role, SessionSizes, TlsEngine},
    error::{TunnelError, TunnelErrorKind},
    factory::EngineFactory,
    handshake::{HandshakeDriver, HandshakeOutcome, HandshakePlan},
    pump::{self, FlushOutcome},
};

/// 一次稳态读取的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    /// 写入目标切片的明文字节数；可能为 0（暂无可交付数据）。
    Data(usize),
    /// 目标切片不小于引擎明文尺寸，引擎仍报告空间不足；调用方应换用更大的切片。
    BufferOverflow,
    /// 对端已发送 close-notify，且没有剩余明文。
    Closed,
}

/// 在原始字节通道之上透明收发 TLS 的隧道。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 调用方只面对明文 `read`/`write`，握手、记录分片、缓冲增长与重协商都在内部完成；
/// - 套接字既可以是阻塞的，也可以是非阻塞的：后者遇到 `WouldBlock` 时以返回值表达，
///   隧道状态原样保留，再次调用即可继续。
///
/// ## 逻辑（How）
/// - `initialize`：绑定通道，向工厂索取引擎与握手计划，按引擎尺寸分配四块缓冲；
/// - `do_handshake`：执行握手计划；
/// - `read`：先交付 `app_recv` 残留，再按目标大小选择直写（快路径）或经 `app_recv` 中转；
/// - `write`：先冲刷上次残留的密文，然后循环“加密 → 推进源 → 冲刷”，直到源耗尽或背压；
/// - 读写后若引擎报告非终态握手状态，视为重协商并重新进入握手。
///
/// ## 契约（What）
/// - 单次 `read` 至多读取一次套接字；
/// - `write` 返回值不超过调用时 `src.remaining()`；
/// - `do_handshake`/`read`/`write` 返回非 [`TunnelErrorKind::Usage`] 错误前隧道已拆除；
/// - `cleanup` 之后任何操作返回 [`TunnelError::EngineNotInitialized`]。
///
/// ## 风险与权衡（Trade-offs）
/// - 隧道不是 `Sync` 的共享对象：全部操作经 `&mut self`，并发访问需由调用方串行化。
#[derive(Debug)]
pub struct TlsTunnel<S, E> {
    channel: S,
    engine: Option<E>,
    buffers: BufferData,
    plan: HandshakePlan,
    sizes: SessionSizes,
    role: Role,
    handshake_started: bool,
    inbound_closed: bool,
}

impl<S, E> TlsTunnel<S, E>
where
    S: Read + Write,
    E: TlsEngine,
{
    /// 绑定通道并创建引擎与工作缓冲。
    pub fn initialize<F>(channel: S, factory: &F) -> Result<Self, TunnelError>
    where
        F: EngineFactory<Engine = E> + ?Sized,
    {
        let engine = factory.create_engine()?;
        let sizes = engine.session_sizes();
        let role = engine.role();
        let buffers = BufferData::new(sizes, factory.options());
        debug!(
            ?role,
            application_buffer_size = sizes.application_buffer_size,
            packet_buffer_size = sizes.packet_buffer_size,
            "tls tunnel initialized"
        );
        Ok(Self {
            channel,
            engine: Some(engine),
            buffers,
            plan: factory.handshake_plan(),
            sizes,
            role,
            handshake_started: false,
            inbound_closed: false,
        })
    }

    /// 执行握手计划。
    ///
    /// 返回 [`HandshakeOutcome::WouldBlock`] 时待套接字就绪后再次调用；
    /// 任何错误都会先拆除隧道再返回。
    pub fn do_handshake(&mut self) -> Result<HandshakeOutcome, TunnelError> {
        let result = self.run_plan();
        self.tear_down_on_fatal("handshake", result)
    }

    /// 致命错误在交还调用方之前拆除隧道；时序错误原样返回。
    fn tear_down_on_fatal<T>(
        &mut self,
        operation: &'static str,
        result: Result<T, TunnelError>,
    ) -> Result<T, TunnelError> {
        if let Err(err) = &result {
            let kind = err.kind();
            if kind != TunnelErrorKind::Usage {
                warn!(
                    role = ?self.role,
                    ?kind,
                    error = %err,
                    "tls {operation} failed; tearing tunnel down"
                );
                self.cleanup();
            }
        }
        result
    }

    fn run_plan(&mut self) -> Result<HandshakeOutcome, TunnelError> {
        let engine = self
            .engine
            .as_mut()
            .ok_or(TunnelError::EngineNotInitialized {
                operation: "handshake",
            })?;
        if !self.handshake_started {
            engine.begin_handshake()?;
            self.handshake_started = true;
        }
        let mut driver = HandshakeDriver::new(&mut self.channel, engine, &mut self.buffers);
        self.plan.execute(&mut driver)
    }

    /// 读取明文到 `dst`。
    pub fn read(&mut self, dst: &mut [u8]) -> Result<ReadOutcome, TunnelError> {
        let result = self.read_plaintext(dst);
        self.tear_down_on_fatal("read", result)
    }

    fn read_plaintext(&mut self, dst: &mut [u8]) -> Result<ReadOutcome, TunnelError> {
        if self.engine.is_none() {
            return Err(TunnelError::EngineNotInitialized { operation: "read" });
        }

        let filled = self.buffers.app_recv.readable().copy_into(dst);
        if filled == dst.len() {
            return Ok(ReadOutcome::Data(filled));
        }
        if self.inbound_closed {
            return Ok(match filled {
                0 => ReadOutcome::Closed,
                n => ReadOutcome::Data(n),
            });
        }

        let outcome = self.read_from_engine(dst, filled)?;
        self.renegotiate_if_needed()?;
        Ok(outcome)
    }

    fn read_from_engine(
        &mut self,
        dst: &mut [u8],
        mut filled: usize,
    ) -> Result<ReadOutcome, TunnelError> {
        let Self {
            channel,
            engine,
            buffers,
            sizes,
            inbound_closed,
            ..
        } = self;
        let engine = engine
            .as_mut()
            .ok_or(TunnelError::EngineNotInitialized { operation: "read" })?;

        // 已交付字节或引擎仍持有明文时不读套接字，避免阻塞式通道在此挂起。
        if filled == 0 && buffers.net_recv.is_writable() && engine.buffered_plaintext() == 0 {
            pump::fill_from_channel(channel, &mut buffers.net_recv, "read")?;
        }

        let mut closed = false;
        if dst.len() - filled >= sizes.application_buffer_size {
            loop {
                let result = pump::unwrap_direct(engine, &mut buffers.net_recv, &mut dst[filled..])?;
                filled += result.produced;
                match result.status {
                    EngineStatus::BufferOverflow if filled == 0 => {
                        return Ok(ReadOutcome::BufferOverflow);
                    }
                    EngineStatus::Closed => {
                        closed = true;
                        break;
                    }
                    EngineStatus::Ok
                        if result.made_progress()
                            && filled < dst.len()
                            && engine.handshake_status().is_terminal() => {}
                    _ => break,
                }
            }
        } else {
            loop {
                let result = pump::unwrap_into(engine, &mut buffers.net_recv, &mut buffers.app_recv)?;
                match result.status {
                    EngineStatus::Closed => {
                        closed = true;
                        break;
                    }
                    EngineStatus::Ok
                        if result.made_progress() && engine.handshake_status().is_terminal() => {}
                    _ => break,
                }
            }
            filled += buffers.app_recv.readable().copy_into(&mut dst[filled..]);
        }

        if closed && buffers.app_recv.is_empty() {
            *inbound_closed = true;
            debug!(role = ?engine.role(), "peer sent close-notify");
        }
        trace!(filled, closed, "tls read");
        Ok(match filled {
            0 if closed => ReadOutcome::Closed,
            n => ReadOutcome::Data(n),
        })
    }

    /// 加密并发送 `src` 中的明文，返回消费的字节数。
    ///
    /// 套接字停止接收时提前返回，未消费的字节留在 `src` 中。
    pub fn write<B>(&mut self, src: &mut B) -> Result<usize, TunnelError>
    where
        B: Buf + ?Sized,
    {
        let result = self.write_plaintext(src);
        self.tear_down_on_fatal("write", result)
    }

    fn write_plaintext<B>(&mut self, src: &mut B) -> Result<usize, TunnelError>
    where
        B: Buf + ?Sized,
    {
        {
            let Self {
                channel,
                engine,
                buffers,
                ..
            } = &mut *self;
            if engine.is_none() {
                return Err(TunnelError::EngineNotInitialized { operation: "write" });
            }
            if pump::flush_to_channel(channel, &mut buffers.net_send, "write")?
                == FlushOutcome::Stalled
            {
                return Ok(0);
            }
        }

        let mut consumed = 0;
        while src.has_remaining() {
            let (result, flushed, status) = {
                let Self {
                    channel,
                    engine,
                    buffers,
                    ..
                } = &mut *self;
                let engine = engine
                    .as_mut()
                    .ok_or(TunnelError::EngineNotInitialized { operation: "write" })?;
                let result = pump::wrap_into(engine, src.chunk(), &mut buffers.net_send)?;
                src.advance(result.consumed);
                let flushed = pump::flush_to_channel(channel, &mut buffers.net_send, "write")?;
                (result, flushed, engine.handshake_status())
            };
            consumed += result.consumed;

            if result.status == EngineStatus::Closed || flushed == FlushOutcome::Stalled {
                break;
            }
            if !status.is_terminal() {
                if self.run_plan()? == HandshakeOutcome::WouldBlock {
                    break;
                }
                continue;
            }
            if result.consumed == 0 {
                break;
            }
        }
        trace!(consumed, "tls write");
        Ok(consumed)
    }

    /// 依次写出 `srcs[offset..offset + length]`，遇到未能完全消费的缓冲即停止。
    pub fn write_buffers<B>(
        &mut self,
        srcs: &mut [B],
        offset: usize,
        length: usize,
    ) -> Result<usize, TunnelError>
    where
        B: Buf,
    {
        let mut total = 0;
        for src in srcs.iter_mut().skip(offset).take(length) {
            total += self.write(src)?;
            if src.has_remaining() {
                break;
            }
        }
        Ok(total)
    }

    fn renegotiate_if_needed(&mut self) -> Result<(), TunnelError> {
        let renegotiating = self
            .engine
            .as_ref()
            .is_some_and(|engine| !engine.handshake_status().is_terminal());
        if renegotiating {
            debug!(role = ?self.role, "peer requested renegotiation");
            self.run_plan()?;
        }
        Ok(())
    }

    /// 拆除隧道：丢弃全部缓冲内容，关闭出站方向并释放引擎。可重复调用。
    pub fn cleanup(&mut self) {
        self.buffers.clear();
        if let Some(mut engine) = self.engine.take() {
            engine.close_outbound();
            debug!(role = ?self.role, "tls tunnel cleaned up");
        }
    }

    /// 当前会话协商出的协议版本名，例如 `TLSv1_3`。
    pub fn active_protocol_version(&self) -> Result<String, TunnelError> {
        let engine = self
            .engine
            .as_ref()
            .ok_or(TunnelError::EngineNotInitialized {
                operation: "active_protocol_version",
            })?;
        engine
            .protocol_version()
            .ok_or(TunnelError::HandshakeIncomplete)
    }

    pub fn channel(&self) -> &S {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut S {
        &mut self.channel
    }

    pub fn buffers(&self) -> &BufferData {
        &self.buffers
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// 对端是否已关闭入站方向。
    pub fn is_inbound_closed(&self) -> bool {
        self.inbound_closed
    }

    /// 引擎是否仍然存活（`cleanup` 之前）。
    pub fn is_active(&self) -> bool {
        self.engine.is_some()
    }
}
