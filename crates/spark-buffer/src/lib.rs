//! `spark-buffer` 提供 TLS 隧道使用的可增长字节缓冲。
//!
//! # 模块定位（Why）
//! - 隧道需要四块独立缓冲在密文/明文之间搬运字节，且必须保证跨越多次部分读写时
//!   不丢字节、不重复、不乱序；
//! - 将“翻转读写方向 + 回收已读区域”的样板收敛到作用域守卫中，
//!   调用点不再手写 flip/compact，任何退出路径（包括 `?` 传播）都能维持不变量。
//!
//! # 设计概要（How）
//! - [`SafeBuffer`] 持有唯一的连续内存区域，用读游标与写游标划分“未读窗口”与“空闲窗口”；
//! - [`SafeBuffer::writable`] 返回 [`WriteScope`]，暴露空闲窗口并通过 `commit` 推进写游标；
//! - [`SafeBuffer::readable`] 返回 [`ReadScope`]，暴露未读窗口（同时实现 [`bytes::Buf`]），
//!   守卫析构时把残留字节压缩回区域头部；
//! - [`SafeBuffer::double_size`] 无条件倍增容量，仅搬运未读字节。
//!
//! # 契约说明（What）
//! - 单一所有者：缓冲不做任何内部同步，扩容安全性来自 `&mut self` 独占借用；
//! - 下溢标记：接收路径在解密报告“数据不足”时调用 [`SafeBuffer::mark_underflow`]，
//!   标记只会在后续写入真正推进写游标时清除。

mod safe_buffer;

pub use safe_buffer::{ReadScope, SafeBuffer, WriteScope};
