use spark_buffer::SafeBuffer;

use crate::{engine::SessionSizes, options::TunnelOptions};

/// 隧道的四块工作缓冲。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 分别承载“入站密文 / 入站明文 / 出站明文 / 出站密文”，每块独立增长，互不挤占；
/// - 接收侧按引擎尺寸放大更多倍，以吸收握手消息与分片带来的突发，减少倍增次数。
///
/// ## 契约（What）
/// - `net_recv`：`packet_buffer_size × receive_buffer_factor`；
/// - `app_recv`：`application_buffer_size × receive_buffer_factor`；
/// - `app_send`：`application_buffer_size × send_buffer_factor`；
/// - `net_send`：`packet_buffer_size × send_buffer_factor`；
/// - 生命周期与隧道一致，只在引擎初始化时创建一次。
#[derive(Debug)]
pub struct BufferData {
    pub net_recv: SafeBuffer,
    pub app_recv: SafeBuffer,
    pub app_send: SafeBuffer,
    pub net_send: SafeBuffer,
}

impl BufferData {
    pub fn new(sizes: SessionSizes, options: &TunnelOptions) -> Self {
        let recv = options.receive_buffer_factor;
        let send = options.send_buffer_factor;
        Self {
            net_recv: SafeBuffer::with_capacity(sizes.packet_buffer_size.saturating_mul(recv)),
            app_recv: SafeBuffer::with_capacity(sizes.application_buffer_size.saturating_mul(recv)),
            app_send: SafeBuffer::with_capacity(sizes.application_buffer_size.saturating_mul(send)),
            net_send: SafeBuffer::with_capacity(sizes.packet_buffer_size.saturating_mul(send)),
        }
    }

    /// 丢弃全部缓冲内容，容量保持不变。
    pub fn clear(&mut self) {
        self.net_recv.clear();
        self.app_recv.clear();
        self.app_send.clear();
        self.net_send.clear();
    }
}
