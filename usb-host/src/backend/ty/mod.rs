use usb_if::Speed;

use crate::{bus::Bus, err::Result, urb::UrbSlot};

pub mod transfer;

/// 硬件后端需要实现的操作
///
/// 所有方法都在主机的单一执行上下文中调用。后端不直接调用任何用户回调，
/// 完成结果与端口事件都通过 [`Bus`] 排队，由主机统一派发。
pub trait HostOp {
    /// 初始化控制器
    fn init(&mut self, now: u64) -> Result;

    /// 根端口当前速度
    fn speed(&self) -> Speed;

    /// 处理硬件事件
    fn poll(&mut self, bus: &mut Bus, now: u64);

    /// 复位根端口
    fn reset(&mut self, now: u64);

    /// 尝试为 URB 分配通道并启动，没有空闲通道时 URB 保持未分配状态
    fn submit(&mut self, bus: &mut Bus, urb: UrbSlot);

    /// 释放 URB 占用的通道
    fn cancel(&mut self, bus: &mut Bus, urb: UrbSlot);
}
