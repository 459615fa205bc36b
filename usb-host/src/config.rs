/// 设备表容量
pub const MAX_DEVICES: usize = 8;
/// URB 池容量
pub const MAX_URBS: usize = 12;
/// 待派发的主机事件（完成回调、连接/断开通知）队列深度
pub const EVENT_QUEUE_DEPTH: usize = 32;

/// USB 地址范围 1..=127
pub const MAX_ADDRESS: u8 = 127;

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// 枚举阶段每个控制传输的超时，毫秒
    pub enumeration_timeout_ms: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            enumeration_timeout_ms: 1000,
        }
    }
}
