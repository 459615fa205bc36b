use usb_if::{Speed, err::TransferError, transfer::EndpointAddress};

use crate::{
    backend::{
        dwc::{DwcConfig, DwcOtg, reg::OtgRegs},
        ty::{
            HostOp,
            transfer::{Completion, Transfer},
        },
    },
    bus::{Bus, HostEvent, PortEvent},
    config::{HostConfig, MAX_DEVICES},
    device::{Device, DeviceId, DeviceRegistry, DisconnectCallback},
    enumeration,
    err::{Result, USBError},
    urb::{Owner, UrbId, UrbSlot},
};

/// 新设备完成枚举后调用
pub type ConnectCallback = fn(host: &mut dyn HostHandle, dev: DeviceId);

/// 回调中可用的主机操作
pub trait HostHandle {
    /// 提交传输，校验失败或资源不足时同步调用回调并返回错误
    fn submit_transfer(&mut self, transfer: Transfer) -> core::result::Result<UrbId, TransferError>;

    /// 取消传输，未知 ID 忽略
    fn cancel_transfer(&mut self, urb: UrbId);

    fn devices(&self) -> &DeviceRegistry;

    fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices().get(id)
    }

    fn register_disconnected_callback(
        &mut self,
        dev: DeviceId,
        callback: DisconnectCallback,
    ) -> Result;

    fn toggle(&self, dev: DeviceId, ep: EndpointAddress) -> Option<bool> {
        self.device(dev).map(|d| d.toggle(ep))
    }

    fn set_toggle(&mut self, dev: DeviceId, ep: EndpointAddress, data1: bool) -> Result;

    fn reset_toggles(&mut self, dev: DeviceId) -> Result;

    /// 主机单调时钟，微秒
    fn now(&self) -> u64;
}

/// USB 主机
pub struct USBHost<B> {
    backend: B,
    bus: Bus,
    config: HostConfig,
    connected: Option<ConnectCallback>,
}

impl<R: OtgRegs, const CHANNELS: usize> USBHost<DwcOtg<R, CHANNELS>> {
    pub fn new_dwc(regs: R, dwc: DwcConfig, config: HostConfig) -> Result<Self> {
        USBHost::new(DwcOtg::new(regs, dwc), config)
    }
}

impl<B: HostOp> USBHost<B> {
    /// 初始化后端并创建主机
    pub fn new(mut backend: B, config: HostConfig) -> Result<Self> {
        let bus = Bus::new();
        backend.init(bus.now())?;
        Ok(Self {
            backend,
            bus,
            config,
            connected: None,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn speed(&self) -> Speed {
        self.backend.speed()
    }

    pub fn register_connected_callback(&mut self, callback: ConnectCallback) {
        self.connected = Some(callback);
    }

    pub fn device_by_address(&self, address: u8) -> Option<DeviceId> {
        self.bus.devices.by_address(address).map(Device::id)
    }

    /// `parent` 为 `None` 时返回根端口设备
    pub fn devices_by_parent(
        &self,
        parent: Option<DeviceId>,
    ) -> heapless::Vec<DeviceId, MAX_DEVICES> {
        self.bus.devices.children(parent).collect()
    }

    /// 主机轮询入口，`elapsed_us` 为距上次调用经过的时间
    ///
    /// 调用间隔必须小于帧计数器半个周期（约 8 秒）。
    pub fn poll(&mut self, elapsed_us: u32) {
        self.bus.advance_clock(elapsed_us);
        let now = self.bus.now();

        self.backend.poll(&mut self.bus, now);

        while let Some(event) = self.bus.port_events.pop_front() {
            match event {
                PortEvent::Connected(speed) => self.root_connected(speed),
                PortEvent::Disconnected => self.root_disconnected(),
            }
        }

        self.sweep();
        self.dispatch();
    }

    /// 断开设备并复位其所在端口
    pub fn reset_device(&mut self, dev: DeviceId) -> Result {
        let device = self
            .bus
            .devices
            .get(dev)
            .filter(|d| !d.disconnecting)
            .ok_or(USBError::NotFound)?;
        let root = device.is_root();

        self.disconnect(dev);
        let result = if root {
            self.backend.reset(self.bus.now());
            Ok(())
        } else {
            warn!("hub port reset is not supported");
            Err(USBError::NotSupported)
        };
        self.dispatch();
        result
    }

    fn root_connected(&mut self, speed: Speed) {
        if let Some(old) = self.bus.devices.root() {
            warn!("root port reconnected without disconnect");
            self.disconnect(old);
        }
        self.device_connected(None, 0, speed);
    }

    fn root_disconnected(&mut self) {
        if let Some(root) = self.bus.devices.root() {
            self.disconnect(root);
        }
    }

    pub(crate) fn device_connected(&mut self, parent: Option<DeviceId>, port: u8, speed: Speed) {
        let Some(id) = self.bus.devices.insert(parent, port, speed) else {
            warn!("no free device slot for new {:?} speed device", speed);
            return;
        };
        info!("device {:?} connected, {:?} speed", id, speed);
        enumeration::start(self, id);
    }

    /// 移除设备：先结束其 URB，再递归移除子设备，然后通知，回调返回后释放槽位
    pub(crate) fn disconnect(&mut self, dev: DeviceId) {
        if !self.bus.devices.get(dev).is_some_and(|d| !d.disconnecting) {
            return;
        }

        for slot in self.bus.urbs.for_device(dev) {
            self.finalize(slot, Err(TransferError::NoDevice));
        }

        let children: heapless::Vec<DeviceId, MAX_DEVICES> =
            self.bus.devices.children(Some(dev)).collect();
        for child in children {
            self.disconnect(child);
        }

        let Some(device) = self.bus.devices.get_mut(dev) else {
            return;
        };
        info!("device {:?} (address {}) disconnected", dev, device.address());
        match device.disconnected {
            Some(callback) if !self.bus.events.is_full() => {
                device.disconnecting = true;
                self.bus.push_event(HostEvent::Disconnected(dev, callback));
            }
            Some(_) => {
                error!("host event queue full, device {:?} removed without notice", dev);
                self.bus.devices.remove(dev);
            }
            None => {
                self.bus.devices.remove(dev);
            }
        }
    }

    /// 结束 URB，必要时先让后端释放通道
    pub(crate) fn finalize(
        &mut self,
        slot: UrbSlot,
        result: core::result::Result<(), TransferError>,
    ) {
        let assigned = self
            .bus
            .urbs
            .get(slot)
            .is_some_and(|urb| urb.channel().is_some());
        if assigned {
            self.backend.cancel(&mut self.bus, slot);
        }
        self.bus.complete(slot, result);
    }

    /// 超时检查，并把未分配通道的 URB 再交给后端
    fn sweep(&mut self) {
        let now = self.bus.now();
        for slot in self.bus.urbs.occupied() {
            let Some(urb) = self.bus.urbs.get(slot) else {
                continue;
            };
            if urb.deadline.is_some_and(|deadline| now >= deadline) {
                debug!("URB {} timed out", urb.id().get());
                self.finalize(slot, Err(TransferError::Timeout));
            } else if urb.channel().is_none() {
                self.backend.submit(&mut self.bus, slot);
            }
        }
    }

    /// 按产生顺序派发排队的事件
    fn dispatch(&mut self) {
        while let Some(event) = self.bus.events.pop_front() {
            match event {
                HostEvent::Transfer {
                    owner: Owner::Enumeration(dev),
                    completion,
                    ..
                } => enumeration::on_complete(self, dev, &completion),
                HostEvent::Transfer {
                    callback: Some(callback),
                    completion,
                    ..
                } => callback(self, &completion),
                HostEvent::Transfer { .. } => {}
                HostEvent::Connected(dev) => {
                    if let Some(callback) = self.connected {
                        callback(self, dev);
                    }
                }
                HostEvent::Disconnected(dev, callback) => {
                    callback(self, dev);
                    self.bus.devices.remove(dev);
                }
            }
        }
    }

    pub(crate) fn submit(
        &mut self,
        transfer: Transfer,
        owner: Owner,
    ) -> core::result::Result<UrbId, TransferError> {
        let Some(dev) = self
            .bus
            .devices
            .get(transfer.device)
            .filter(|d| !d.disconnecting)
        else {
            return Err(TransferError::NoDevice);
        };
        transfer.validate_shape(dev.speed())?;
        if owner == Owner::Application {
            transfer.validate_buffer()?;
        }

        let timeout_ms = match owner {
            Owner::Application => transfer.timeout_ms,
            Owner::Enumeration(_) => self.config.enumeration_timeout_ms,
        };
        let deadline = (timeout_ms != 0).then(|| self.bus.now() + timeout_ms as u64 * 1000);

        let (slot, id) = self
            .bus
            .urbs
            .alloc(transfer, owner, deadline)
            .map_err(|_| TransferError::ResourceUnavailable)?;
        trace!("URB {} submitted", id.get());
        self.backend.submit(&mut self.bus, slot);
        Ok(id)
    }

    pub(crate) fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }
}

impl<B: HostOp> HostHandle for USBHost<B> {
    fn submit_transfer(
        &mut self,
        transfer: Transfer,
    ) -> core::result::Result<UrbId, TransferError> {
        let callback = transfer.callback;
        let snapshot = callback.map(|_| transfer.clone());
        match self.submit(transfer, Owner::Application) {
            Ok(id) => Ok(id),
            Err(err) => {
                debug!("transfer refused: {}", err);
                if let (Some(callback), Some(transfer)) = (callback, snapshot) {
                    let completion = Completion {
                        urb: None,
                        result: Err(err),
                        transfer,
                    };
                    callback(self, &completion);
                }
                Err(err)
            }
        }
    }

    fn cancel_transfer(&mut self, urb: UrbId) {
        let Some(slot) = self.bus.urbs.find(urb) else {
            return;
        };
        debug!("URB {} cancelled", urb.get());
        self.finalize(slot, Err(TransferError::Cancelled));
        self.dispatch();
    }

    fn devices(&self) -> &DeviceRegistry {
        &self.bus.devices
    }

    fn register_disconnected_callback(
        &mut self,
        dev: DeviceId,
        callback: DisconnectCallback,
    ) -> Result {
        let device = self.bus.devices.get_mut(dev).ok_or(USBError::NotFound)?;
        device.disconnected = Some(callback);
        Ok(())
    }

    fn set_toggle(&mut self, dev: DeviceId, ep: EndpointAddress, data1: bool) -> Result {
        let device = self.bus.devices.get_mut(dev).ok_or(USBError::NotFound)?;
        device.set_toggle(ep, data1);
        Ok(())
    }

    fn reset_toggles(&mut self, dev: DeviceId) -> Result {
        let device = self.bus.devices.get_mut(dev).ok_or(USBError::NotFound)?;
        device.reset_toggles();
        Ok(())
    }

    fn now(&self) -> u64 {
        self.bus.now()
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;
    use std::vec::Vec;

    use super::*;

    /// 不产生任何硬件事件的后端
    struct NullBackend;

    impl HostOp for NullBackend {
        fn init(&mut self, _now: u64) -> Result {
            Ok(())
        }

        fn speed(&self) -> Speed {
            Speed::Unknown
        }

        fn poll(&mut self, _bus: &mut Bus, _now: u64) {}

        fn reset(&mut self, _now: u64) {}

        fn submit(&mut self, _bus: &mut Bus, _urb: UrbSlot) {}

        fn cancel(&mut self, bus: &mut Bus, urb: UrbSlot) {
            bus.detach_channel(urb);
        }
    }

    std::thread_local! {
        static GONE: RefCell<Vec<(DeviceId, bool)>> = const { RefCell::new(Vec::new()) };
    }

    fn record_gone(host: &mut dyn HostHandle, dev: DeviceId) {
        let visible = host.device(dev).is_some();
        GONE.with(|g| g.borrow_mut().push((dev, visible)));
    }

    #[test]
    fn disconnect_removes_children_first() {
        let mut host = USBHost::new(NullBackend, HostConfig::default()).unwrap();
        host.device_connected(None, 0, Speed::High);
        let root = host.devices_by_parent(None)[0];
        host.device_connected(Some(root), 1, Speed::Full);
        let child = host.devices_by_parent(Some(root))[0];
        assert_eq!(host.bus.urbs.len(), 2);
        assert_eq!(host.bus.urbs.for_device(child).len(), 1);

        host.register_disconnected_callback(root, record_gone).unwrap();
        host.register_disconnected_callback(child, record_gone).unwrap();

        host.disconnect(root);
        assert!(host.bus.urbs.is_empty());
        assert!(host.devices_by_parent(None).is_empty());
        assert!(host.devices_by_parent(Some(root)).is_empty());

        host.dispatch();
        let gone = GONE.with(|g| core::mem::take(&mut *g.borrow_mut()));
        assert_eq!(gone, [(child, true), (root, true)]);
        assert!(!host.bus.devices.contains(child));
        assert!(!host.bus.devices.contains(root));
        assert!(host.bus.events.is_empty());
    }

    #[test]
    fn disconnect_without_callback_frees_slot_at_once() {
        let mut host = USBHost::new(NullBackend, HostConfig::default()).unwrap();
        host.device_connected(None, 0, Speed::Full);
        let root = host.devices_by_parent(None)[0];

        host.disconnect(root);
        assert!(!host.bus.devices.contains(root));
        assert_eq!(host.reset_device(root), Err(USBError::NotFound));
    }
}
