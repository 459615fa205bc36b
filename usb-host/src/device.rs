use usb_if::{Speed, transfer::EndpointAddress};

use crate::{
    HostHandle,
    config::{MAX_ADDRESS, MAX_DEVICES},
    enumeration::EnumerationStage,
};

/// 设备断开通知，仅对已完成枚举的设备调用
pub type DisconnectCallback = fn(host: &mut dyn HostHandle, dev: DeviceId);

/// 设备表中的句柄，槽位复用后旧句柄失效
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    index: u8,
    generation: u16,
}

impl DeviceId {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

pub struct Device {
    id: DeviceId,
    parent: Option<DeviceId>,
    port: u8,
    pub(crate) address: u8,
    speed: Speed,
    pub(crate) ep0_size: u16,
    /// bit0..15 OUT 端点, bit16..31 IN 端点
    toggles: u32,
    pub(crate) disconnected: Option<DisconnectCallback>,
    /// 已断开，槽位保留到断开回调返回
    pub(crate) disconnecting: bool,
    hub_ports: u8,
    pub(crate) stage: EnumerationStage,
    /// 枚举时分配但尚未生效的地址
    pub(crate) pending_address: u8,
    /// 枚举阶段读取设备描述符前 8 字节的缓冲
    pub(crate) scratch: [u8; 8],
}

impl Device {
    fn new(id: DeviceId, parent: Option<DeviceId>, port: u8, speed: Speed) -> Self {
        Self {
            id,
            parent,
            port,
            address: 0,
            speed,
            ep0_size: speed.default_ep0_size(),
            toggles: 0,
            disconnected: None,
            disconnecting: false,
            hub_ports: 0,
            stage: EnumerationStage::Start,
            pending_address: 0,
            scratch: [0; 8],
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// `None` for the device on the root port.
    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    /// Bus address, 0 until SET_ADDRESS has completed.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn ep0_max_packet_size(&self) -> u16 {
        self.ep0_size
    }

    pub fn hub_ports(&self) -> u8 {
        self.hub_ports
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_enumerated(&self) -> bool {
        self.stage == EnumerationStage::Done
    }

    /// Gone from the bus; only still readable from its disconnect callback.
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting
    }

    pub fn stage(&self) -> EnumerationStage {
        self.stage
    }

    pub fn toggle(&self, ep: EndpointAddress) -> bool {
        self.toggles & toggle_mask(ep) != 0
    }

    pub fn set_toggle(&mut self, ep: EndpointAddress, data1: bool) {
        let mask = toggle_mask(ep);
        if data1 {
            self.toggles |= mask;
        } else {
            self.toggles &= !mask;
        }
    }

    pub fn flip_toggle(&mut self, ep: EndpointAddress) {
        self.toggles ^= toggle_mask(ep);
    }

    /// All endpoints back to DATA0, e.g. after SET_CONFIGURATION.
    pub fn reset_toggles(&mut self) {
        self.toggles = 0;
    }
}

fn toggle_mask(ep: EndpointAddress) -> u32 {
    let shift = ep.number() as u32 + if ep.is_in() { 16 } else { 0 };
    1 << shift
}

pub struct DeviceRegistry {
    slots: [Option<Device>; MAX_DEVICES],
    generations: [u16; MAX_DEVICES],
    next_address: u8,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_DEVICES],
            generations: [0; MAX_DEVICES],
            next_address: 1,
        }
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.slots
            .get(id.index())?
            .as_ref()
            .filter(|dev| dev.id == id)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.slots
            .get_mut(id.index())?
            .as_mut()
            .filter(|dev| dev.id == id)
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.slots.iter().flatten()
    }

    /// Only devices still on the bus.
    fn live(&self) -> impl Iterator<Item = &Device> {
        self.iter().filter(|dev| !dev.disconnecting)
    }

    pub fn by_address(&self, address: u8) -> Option<&Device> {
        self.live().find(|dev| dev.address == address)
    }

    /// Devices attached to `parent`; `None` selects the root device.
    pub fn children(&self, parent: Option<DeviceId>) -> impl Iterator<Item = DeviceId> + '_ {
        self.live()
            .filter(move |dev| dev.parent == parent)
            .map(|dev| dev.id)
    }

    pub fn root(&self) -> Option<DeviceId> {
        self.children(None).next()
    }

    pub(crate) fn insert(
        &mut self,
        parent: Option<DeviceId>,
        port: u8,
        speed: Speed,
    ) -> Option<DeviceId> {
        let index = self.slots.iter().position(Option::is_none)?;
        let generation = self.generations[index].wrapping_add(1);
        self.generations[index] = generation;
        let id = DeviceId {
            index: index as u8,
            generation,
        };
        self.slots[index] = Some(Device::new(id, parent, port, speed));
        Some(id)
    }

    pub(crate) fn remove(&mut self, id: DeviceId) -> Option<Device> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.as_ref().is_some_and(|dev| dev.id == id) {
            slot.take()
        } else {
            None
        }
    }

    fn address_in_use(&self, address: u8) -> bool {
        self.iter()
            .any(|dev| dev.address == address || dev.pending_address == address)
    }

    /// 轮转分配 1..=127 中未被占用的地址，最多尝试 127 次
    pub(crate) fn allocate_address(&mut self) -> Option<u8> {
        for _ in 0..MAX_ADDRESS {
            let candidate = self.next_address;
            self.next_address = if candidate >= MAX_ADDRESS {
                1
            } else {
                candidate + 1
            };
            if !self.address_in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}
