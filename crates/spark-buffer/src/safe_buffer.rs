use std::io::{self, Read, Write};

use bytes::Buf;
use tracing::debug;

/// 最小容量；零容量的缓冲无法倍增，统一抬升到 1 字节。
const MIN_CAPACITY: usize = 1;

/// 单一所有者的可增长字节缓冲。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - TLS 引擎的 wrap/unwrap 只接受定长切片，当目标空间不足时会报告溢出；
///   `SafeBuffer` 负责在这种情况下原地倍增，并保证已写入但尚未读取的字节不会丢失；
/// - 接收路径还需要记录“上一次解密因数据不足而失败”，以避免在没有新字节时反复空转。
///
/// ## 逻辑（How）
/// - `data` 为整块内存，`read_pos..write_pos` 为未读窗口，`write_pos..capacity` 为空闲窗口；
/// - 读取通过 [`ReadScope`] 完成，守卫析构时执行压缩，因此守卫之外 `read_pos` 恒为 0；
/// - 写入通过 [`WriteScope`] 完成，`commit` 推进写游标并在有进展时清除下溢标记。
///
/// ## 契约（What）
/// - `double_size` 之后未读字节按原顺序位于新区域头部；
/// - `is_writable` 仅在“存在空闲空间且缓冲已排空或已被证明记录不完整”时为真，
///   持有尚未尝试解密的字节时返回假，调用方应先消费这些字节再读套接字。
///
/// ## 风险与权衡（Trade-offs）
/// - 压缩使用 `copy_within`，残留字节较多时存在一次内存搬移；换来的是空闲窗口始终连续；
/// - 倍增没有上限，容量控制交由上层的引擎尺寸与选项决定。
#[derive(Debug)]
pub struct SafeBuffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    underflow: bool,
}

impl SafeBuffer {
    /// 以给定容量创建空缓冲。
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(MIN_CAPACITY)],
            read_pos: 0,
            write_pos: 0,
            underflow: false,
        }
    }

    /// 当前底层区域的总容量。
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// 尚未读取的字节数。
    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// 写游标之后剩余的空闲字节数。
    pub fn spare_capacity(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// 只读方式查看未读窗口，不移动游标。
    pub fn unread(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    pub fn has_underflow(&self) -> bool {
        self.underflow
    }

    /// 记录一次“数据不足以构成完整记录”的解密结果。
    pub fn mark_underflow(&mut self) {
        self.underflow = true;
    }

    /// 缓冲是否需要从套接字补充字节。
    ///
    /// # 契约（What）
    /// - 无空闲空间时返回 `false`，调用方应先倍增；
    /// - 已排空，或者残留字节已被引擎判定为不完整（下溢标记仍在）时返回 `true`；
    /// - 残留字节尚未经过解密尝试时返回 `false`，避免在可处理数据面前阻塞于套接字。
    pub fn is_writable(&self) -> bool {
        self.spare_capacity() > 0 && (self.is_empty() || self.underflow)
    }

    /// 获取写作用域。
    pub fn writable(&mut self) -> WriteScope<'_> {
        WriteScope { buffer: self }
    }

    /// 获取读作用域；作用域结束时未读字节被压缩到区域头部。
    pub fn readable(&mut self) -> ReadScope<'_> {
        ReadScope { buffer: self }
    }

    /// 容量倍增，保留全部未读字节及其顺序。
    pub fn double_size(&mut self) {
        let next_capacity = self.capacity().saturating_mul(2).max(MIN_CAPACITY);
        let live = self.len();
        let mut next = vec![0; next_capacity];
        next[..live].copy_from_slice(&self.data[self.read_pos..self.write_pos]);
        debug!(
            from = self.capacity(),
            to = next_capacity,
            live,
            "safe buffer grew"
        );
        self.data = next;
        self.read_pos = 0;
        self.write_pos = live;
    }

    /// 丢弃全部内容并清除下溢标记，容量保持不变。
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.underflow = false;
    }

    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
            return;
        }
        self.data.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
    }
}

/// 写作用域：暴露空闲窗口，显式 `commit` 才会推进写游标。
#[derive(Debug)]
pub struct WriteScope<'a> {
    buffer: &'a mut SafeBuffer,
}

impl WriteScope<'_> {
    /// 空闲窗口长度。
    pub fn remaining(&self) -> usize {
        self.buffer.spare_capacity()
    }

    /// 可直接交给引擎写入的空闲窗口。
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let start = self.buffer.write_pos;
        &mut self.buffer.data[start..]
    }

    /// 确认 `written` 字节已写入空闲窗口头部。
    ///
    /// # Panics
    /// `written` 超过空闲窗口长度时 panic，这意味着调用方越界报告了写入量。
    pub fn commit(&mut self, written: usize) {
        assert!(
            written <= self.remaining(),
            "commit of {written} bytes exceeds spare capacity {}",
            self.remaining()
        );
        self.buffer.write_pos += written;
        if written > 0 {
            self.buffer.underflow = false;
        }
    }

    /// 复制尽可能多的 `src` 字节，返回实际复制量。
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let len = src.len().min(self.remaining());
        self.spare_mut()[..len].copy_from_slice(&src[..len]);
        self.commit(len);
        len
    }

    /// 从 `reader` 执行恰好一次读取并提交读到的字节。
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let read = reader.read(self.spare_mut())?;
        self.commit(read);
        Ok(read)
    }
}

/// 读作用域：暴露未读窗口，析构时压缩残留字节。
#[derive(Debug)]
pub struct ReadScope<'a> {
    buffer: &'a mut SafeBuffer,
}

impl ReadScope<'_> {
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.unread()
    }

    /// 标记前 `count` 字节已被消费。
    ///
    /// # Panics
    /// `count` 超过未读字节数时 panic。
    pub fn consume(&mut self, count: usize) {
        assert!(
            count <= self.buffer.len(),
            "consume of {count} bytes exceeds readable {}",
            self.buffer.len()
        );
        self.buffer.read_pos += count;
    }

    /// 复制能放进 `dst` 的前缀并消费之，返回复制量。
    pub fn copy_into(&mut self, dst: &mut [u8]) -> usize {
        let len = dst.len().min(self.buffer.len());
        dst[..len].copy_from_slice(&self.as_slice()[..len]);
        self.consume(len);
        len
    }

    /// 向 `writer` 执行恰好一次写入并消费写出的字节。
    pub fn drain_to<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let written = writer.write(self.as_slice())?;
        self.consume(written);
        Ok(written)
    }
}

impl Buf for ReadScope<'_> {
    fn remaining(&self) -> usize {
        self.buffer.len()
    }

    fn chunk(&self) -> &[u8] {
        self.as_slice()
    }

    fn advance(&mut self, cnt: usize) {
        self.consume(cnt);
    }
}

impl Drop for ReadScope<'_> {
    fn drop(&mut self) {
        self.buffer.compact();
    }
}
