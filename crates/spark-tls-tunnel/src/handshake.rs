use std::io::{Read, Write};

use tracing::{debug, trace};

use crate::{
    buffers::BufferData,
    certificate::CertificateValidator,
    engine::{EngineStatus, HandshakeStatus, TlsEngine},
    error::TunnelError,
    pump::{self, FillOutcome, FlushOutcome},
};

/// 一次握手调用的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakeOutcome {
    /// 引擎到达终态，且计划中的全部后置步骤均已通过。
    Finished,
    /// 非阻塞套接字暂时无法推进；状态已保留，待可读/可写后再次调用即可继续。
    WouldBlock,
}

/// 握手计划中的一个步骤。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HandshakeStep {
    /// 驱动引擎握手状态机直至终态。
    Negotiate,
    /// 校验对端证书链的有效期。
    ValidatePeerCertificates(CertificateValidator),
}

/// 按顺序执行的握手步骤列表。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 客户端与服务端的握手差异仅在于“协商成功后是否追加证书校验”；
///   用显式的有序步骤表达这种组合，而不是层层包装握手对象；
///
/// ## 契约（What）
/// - 步骤按插入顺序执行，任一步骤失败立即返回错误；
/// - `Negotiate` 返回 [`HandshakeOutcome::WouldBlock`] 时后续步骤不执行，下次调用从头重放：
///   已完成的协商会立即再次报告终态，因此重放是安全的。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandshakePlan {
    steps: Vec<HandshakeStep>,
}

impl HandshakePlan {
    /// 只包含协商步骤的计划（服务端默认）。
    pub fn negotiate() -> Self {
        Self {
            steps: vec![HandshakeStep::Negotiate],
        }
    }

    /// 协商后校验对端证书（客户端默认）。
    pub fn negotiate_then_validate(validator: CertificateValidator) -> Self {
        Self::negotiate().then(HandshakeStep::ValidatePeerCertificates(validator))
    }

    /// 追加一个步骤。
    pub fn then(mut self, step: HandshakeStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[HandshakeStep] {
        &self.steps
    }

    pub(crate) fn execute<S, E>(
        &self,
        driver: &mut HandshakeDriver<'_, S, E>,
    ) -> Result<HandshakeOutcome, TunnelError>
    where
        S: Read + Write + ?Sized,
        E: TlsEngine + ?Sized,
    {
        for step in &self.steps {
            match step {
                HandshakeStep::Negotiate => {
                    if driver.drive()? == HandshakeOutcome::WouldBlock {
                        return Ok(HandshakeOutcome::WouldBlock);
                    }
                }
                HandshakeStep::ValidatePeerCertificates(validator) => {
                    validator.validate(driver.engine.peer_certificates())?;
                }
            }
        }
        Ok(HandshakeOutcome::Finished)
    }
}

/// 握手状态机驱动器，直接操作套接字与四块缓冲。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// 每轮先冲刷残留的出站密文，再按引擎状态分派：
/// - `Finished`/`NotHandshaking`：终止；
/// - `NeedTask`：同步执行全部委托任务；
/// - `NeedUnwrap`：`net_recv` 需要补充时读一次套接字，随后解密到 `app_recv`
///   （溢出时倍增并重试，下溢时打标记回到循环）；
/// - `NeedWrap`：加密 `app_send` 到 `net_send` 并冲刷到套接字；
/// - `NotStarted`：循环内出现即视为实现缺陷。
///
/// ## 契约（What）
/// - 循环只会经由终态、I/O 错误或非阻塞的 `WouldBlock` 退出；
/// - 每一轮要么执行一次 I/O，要么推进引擎状态，不存在无 I/O 的空转：
///   不交付任务的 `NeedTask`、毫无产出的 `NeedWrap` 都被判为内部错误。
pub(crate) struct HandshakeDriver<'a, S: ?Sized, E: ?Sized> {
    channel: &'a mut S,
    engine: &'a mut E,
    buffers: &'a mut BufferData,
}

/// 单步推进的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Step {
    Continue,
    WouldBlock,
}

impl<'a, S, E> HandshakeDriver<'a, S, E>
where
    S: Read + Write + ?Sized,
    E: TlsEngine + ?Sized,
{
    pub(crate) fn new(channel: &'a mut S, engine: &'a mut E, buffers: &'a mut BufferData) -> Self {
        Self {
            channel,
            engine,
            buffers,
        }
    }

    pub(crate) fn drive(&mut self) -> Result<HandshakeOutcome, TunnelError> {
        let role = self.engine.role();
        loop {
            if pump::flush_to_channel(&mut *self.channel, &mut self.buffers.net_send, "handshake")?
                == FlushOutcome::Stalled
            {
                return Ok(HandshakeOutcome::WouldBlock);
            }

            let status = self.engine.handshake_status();
            trace!(?role, ?status, "handshake step");
            let step = match status {
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    debug!(?role, "handshake finished");
                    return Ok(HandshakeOutcome::Finished);
                }
                HandshakeStatus::NeedTask => self.run_tasks()?,
                HandshakeStatus::NeedUnwrap => self.unwrap_step()?,
                HandshakeStatus::NeedWrap => self.wrap_step()?,
                HandshakeStatus::NotStarted => {
                    return Err(TunnelError::UnexpectedHandshakeStatus { status });
                }
            };
            if step == Step::WouldBlock {
                return Ok(HandshakeOutcome::WouldBlock);
            }
        }
    }

    fn run_tasks(&mut self) -> Result<Step, TunnelError> {
        let executed = pump::run_delegated_tasks(&mut *self.engine);
        if executed == 0 {
            return Err(TunnelError::UnexpectedHandshakeStatus {
                status: HandshakeStatus::NeedTask,
            });
        }
        trace!(executed, "delegated tasks executed");
        Ok(Step::Continue)
    }

    fn unwrap_step(&mut self) -> Result<Step, TunnelError> {
        if self.buffers.net_recv.is_writable() && self.engine.buffered_plaintext() == 0 {
            let filled =
                pump::fill_from_channel(&mut *self.channel, &mut self.buffers.net_recv, "handshake")?;
            if filled == FillOutcome::WouldBlock {
                return Ok(Step::WouldBlock);
            }
        }

        let result = pump::unwrap_into(
            &mut *self.engine,
            &mut self.buffers.net_recv,
            &mut self.buffers.app_recv,
        )?;
        if result.status == EngineStatus::Closed {
            return Err(TunnelError::SessionClosed);
        }
        Ok(Step::Continue)
    }

    fn wrap_step(&mut self) -> Result<Step, TunnelError> {
        let result = {
            let mut src = self.buffers.app_send.readable();
            let result =
                pump::wrap_into(&mut *self.engine, src.as_slice(), &mut self.buffers.net_send)?;
            src.consume(result.consumed);
            result
        };
        if result.status == EngineStatus::Closed {
            return Err(TunnelError::SessionClosed);
        }
        if !result.made_progress() {
            return Err(TunnelError::UnexpectedHandshakeStatus {
                status: HandshakeStatus::NeedWrap,
            });
        }

        match pump::flush_to_channel(&mut *self.channel, &mut self.buffers.net_send, "handshake")? {
            FlushOutcome::Complete => Ok(Step::Continue),
            FlushOutcome::Stalled => Ok(Step::WouldBlock),
        }
    }
}
