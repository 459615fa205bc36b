use crate::{frame::FrameNumber, urb::UrbSlot};

/// 主机通道状态
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// 空闲，可以分配
    #[default]
    Free,
    /// 已请求停止，等待 CHH 后才回到 Free
    Cancelled,
    ControlSetup,
    ControlDataIn,
    ControlDataOut,
    ControlStatusIn,
    ControlStatusOut,
    /// 非控制传输的数据阶段，完成后直接结束 URB
    Callback,
}

impl ChannelState {
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Free | Self::Cancelled)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Channel {
    pub state: ChannelState,
    pub urb: Option<UrbSlot>,
    /// 等待 `submit_frame` 到达后再使能
    pub need_scheduling: bool,
    pub submit_frame: FrameNumber,
}

impl Channel {
    pub const IDLE: Self = Self {
        state: ChannelState::Free,
        urb: None,
        need_scheduling: false,
        submit_frame: FrameNumber::new(0),
    };
}
