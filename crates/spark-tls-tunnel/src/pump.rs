//! 套接字与引擎之间的单步搬运原语。
//!
//! 握手驱动与稳态读写共用这些函数，确保“读一次套接字”“冲刷出站密文”
//! “解密并在溢出时扩容”在两条路径上的语义完全一致。

use std::io::{self, Read, Write};

use spark_buffer::SafeBuffer;
use tracing::trace;

use crate::{
    engine::{EngineResult, EngineStatus, TlsEngine},
    error::TunnelError,
};

/// 单次套接字读取的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum FillOutcome {
    Filled,
    /// 非阻塞套接字暂无数据。
    WouldBlock,
}

/// 冲刷出站密文的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum FlushOutcome {
    Complete,
    /// 套接字不再接受字节，残留密文保留在缓冲中等待下一次冲刷。
    Stalled,
}

/// 从套接字读取恰好一次；流结束映射为 [`TunnelError::Disconnected`]。
pub(crate) fn fill_from_channel<S: Read + ?Sized>(
    channel: &mut S,
    buffer: &mut SafeBuffer,
    operation: &'static str,
) -> Result<FillOutcome, TunnelError> {
    if buffer.spare_capacity() == 0 {
        return Ok(FillOutcome::Filled);
    }
    loop {
        match buffer.writable().fill_from(channel) {
            Ok(0) => return Err(TunnelError::Disconnected { operation }),
            Ok(read) => {
                trace!(read, operation, "socket read");
                return Ok(FillOutcome::Filled);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Ok(FillOutcome::WouldBlock);
            }
            Err(err) => return Err(TunnelError::io(operation, err)),
        }
    }
}

/// 把 `buffer` 中的密文写到套接字，直到排空或套接字停止接收。
///
/// 硬错误发生时缓冲内容被丢弃，错误向上传播。
pub(crate) fn flush_to_channel<S: Write + ?Sized>(
    channel: &mut S,
    buffer: &mut SafeBuffer,
    operation: &'static str,
) -> Result<FlushOutcome, TunnelError> {
    while !buffer.is_empty() {
        let result = buffer.readable().drain_to(channel);
        match result {
            Ok(0) => return Ok(FlushOutcome::Stalled),
            Ok(written) => trace!(written, operation, "socket write"),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Ok(FlushOutcome::Stalled);
            }
            Err(err) => {
                buffer.clear();
                return Err(TunnelError::io(operation, err));
            }
        }
    }
    match channel.flush() {
        Ok(()) => Ok(FlushOutcome::Complete),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(FlushOutcome::Stalled),
        Err(err) => Err(TunnelError::io(operation, err)),
    }
}

/// 解密 `net_recv` 中的密文到 `dst`，溢出时倍增 `dst` 并重试。
///
/// 返回的结果不会是 [`EngineStatus::BufferOverflow`]。报告下溢或毫无进展时
/// `net_recv` 被打上下溢标记；若 `net_recv` 已满则先行倍增，保证下一次读取有空间。
pub(crate) fn unwrap_into<E: TlsEngine + ?Sized>(
    engine: &mut E,
    net_recv: &mut SafeBuffer,
    dst: &mut SafeBuffer,
) -> Result<EngineResult, TunnelError> {
    loop {
        let result = {
            let mut src = net_recv.readable();
            let mut out = dst.writable();
            let result = engine.unwrap(src.as_slice(), out.spare_mut())?;
            src.consume(result.consumed);
            out.commit(result.produced);
            result
        };

        match result.status {
            EngineStatus::BufferOverflow => {
                dst.double_size();
                continue;
            }
            EngineStatus::BufferUnderflow => mark_underflow(net_recv),
            EngineStatus::Ok if !result.made_progress() => mark_underflow(net_recv),
            EngineStatus::Ok | EngineStatus::Closed => {}
        }
        return Ok(result);
    }
}

/// 解密 `net_recv` 中的密文直接写入调用方切片；溢出原样返回，由调用方决定如何处理。
pub(crate) fn unwrap_direct<E: TlsEngine + ?Sized>(
    engine: &mut E,
    net_recv: &mut SafeBuffer,
    dst: &mut [u8],
) -> Result<EngineResult, TunnelError> {
    let result = {
        let mut src = net_recv.readable();
        let result = engine.unwrap(src.as_slice(), dst)?;
        src.consume(result.consumed);
        result
    };
    match result.status {
        EngineStatus::BufferUnderflow => mark_underflow(net_recv),
        EngineStatus::Ok if !result.made_progress() => mark_underflow(net_recv),
        _ => {}
    }
    Ok(result)
}

fn mark_underflow(net_recv: &mut SafeBuffer) {
    if net_recv.spare_capacity() == 0 {
        net_recv.double_size();
    }
    net_recv.mark_underflow();
}

/// 加密 `src` 到 `net_send`，溢出时倍增 `net_send` 并继续；返回累计的消费与产出。
pub(crate) fn wrap_into<E: TlsEngine + ?Sized>(
    engine: &mut E,
    src: &[u8],
    net_send: &mut SafeBuffer,
) -> Result<EngineResult, TunnelError> {
    let mut consumed = 0;
    let mut produced = 0;
    loop {
        let result = {
            let mut out = net_send.writable();
            let result = engine.wrap(&src[consumed..], out.spare_mut())?;
            out.commit(result.produced);
            result
        };
        consumed += result.consumed;
        produced += result.produced;

        if result.status == EngineStatus::BufferOverflow {
            net_send.double_size();
            continue;
        }
        return Ok(EngineResult::new(result.status, consumed, produced));
    }
}

/// 同步执行引擎排队的全部委托任务，返回执行数量。
pub(crate) fn run_delegated_tasks<E: TlsEngine + ?Sized>(engine: &mut E) -> usize {
    let mut executed = 0;
    while let Some(task) = engine.delegated_task() {
        task();
        executed += 1;
    }
    executed
}
