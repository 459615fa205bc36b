//! USB 主机传输引擎
//!
//! 把“在端点上收发数据”的请求变成调度、重试并绑定到硬件通道的事务，
//! 并用同一套机制完成设备枚举。硬件相关部分由 [`HostOp`] 后端实现，
//! 当前提供 DesignWare OTG 后端 [`DwcOtg`]。
//!
//! 主机不使用堆内存，也不依赖中断上下文：应用周期性调用
//! [`USBHost::poll`]，所有回调都在其中派发。

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

use core::sync::atomic::{AtomicU32, Ordering};

pub use usb_if::descriptor::*;
pub use usb_if::err::*;
pub use usb_if::transfer::*;
pub use usb_if::{Speed, host::USBError};

pub mod backend;
pub mod bus;
pub mod config;
pub mod device;
pub mod enumeration;
pub mod err;
pub mod frame;
pub mod host;
pub mod urb;

pub use backend::dwc::{DwcConfig, DwcOtg, reg::MmioRegs};
pub use backend::ty::{
    HostOp,
    transfer::{
        Completion, DataBuffer, Packet, PacketCallback, PacketData, Transfer, TransferCallback,
        TransferFlags,
    },
};
pub use config::HostConfig;
pub use device::{Device, DeviceId, DisconnectCallback};
pub use host::{ConnectCallback, HostHandle, USBHost};
pub use urb::UrbId;

/// 在线程与中断处理程序之间共享的主机
pub struct SharedHost<B> {
    host: spin::Mutex<Option<USBHost<B>>>,
    /// 因锁被占用而跳过的轮询时间，微秒
    skipped_us: AtomicU32,
}

impl<B: HostOp> SharedHost<B> {
    pub const fn empty() -> Self {
        Self {
            host: spin::Mutex::new(None),
            skipped_us: AtomicU32::new(0),
        }
    }

    pub fn install(&self, host: USBHost<B>) {
        *self.host.lock() = Some(host);
    }

    pub fn take(&self) -> Option<USBHost<B>> {
        self.host.lock().take()
    }

    /// 对主机执行操作，未安装时返回 `None`
    pub fn with<T>(&self, f: impl FnOnce(&mut USBHost<B>) -> T) -> Option<T> {
        self.host.lock().as_mut().map(f)
    }

    /// 供定时器中断调用；主机正被占用时跳过，时间累计到下次轮询
    pub fn try_poll(&self, elapsed_us: u32) -> bool {
        let Some(mut guard) = self.host.try_lock() else {
            self.skipped_us.fetch_add(elapsed_us, Ordering::Relaxed);
            return false;
        };
        let Some(host) = guard.as_mut() else {
            return false;
        };
        let skipped = self.skipped_us.swap(0, Ordering::Relaxed);
        host.poll(elapsed_us.saturating_add(skipped));
        true
    }
}
