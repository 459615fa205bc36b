//! 主机与后端共享的状态：设备表、URB 池以及待派发事件

use heapless::Deque;
use usb_if::{Speed, err::TransferError};

use crate::{
    backend::ty::transfer::{Completion, Packet, PacketData, TransferCallback, TransferFlags},
    config::EVENT_QUEUE_DEPTH,
    device::{Device, DeviceId, DeviceRegistry, DisconnectCallback},
    err::TransferResult,
    urb::{Owner, Urb, UrbPool, UrbSlot},
};

/// Root port changes reported by a backend during `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    Connected(Speed),
    Disconnected,
}

pub(crate) enum HostEvent {
    Transfer {
        owner: Owner,
        callback: Option<TransferCallback>,
        completion: Completion,
    },
    Connected(DeviceId),
    Disconnected(DeviceId, DisconnectCallback),
}

pub struct Bus {
    pub(crate) devices: DeviceRegistry,
    pub(crate) urbs: UrbPool,
    pub(crate) events: Deque<HostEvent, EVENT_QUEUE_DEPTH>,
    pub(crate) port_events: Deque<PortEvent, 4>,
    now: u64,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub const fn new() -> Self {
        Self {
            devices: DeviceRegistry::new(),
            urbs: UrbPool::new(),
            events: Deque::new(),
            port_events: Deque::new(),
            now: 0,
        }
    }

    /// Monotonic host time in microseconds.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub(crate) fn advance_clock(&mut self, elapsed_us: u32) {
        self.now = self.now.wrapping_add(elapsed_us as u64);
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn urb(&self, slot: UrbSlot) -> Option<&Urb> {
        self.urbs.get(slot)
    }

    /// Device targeted by the URB in `slot`.
    pub fn urb_device_mut(&mut self, slot: UrbSlot) -> Option<&mut Device> {
        let dev = self.urbs.get(slot)?.transfer.device;
        self.devices.get_mut(dev)
    }

    pub fn attach_channel(&mut self, slot: UrbSlot, channel: u8) {
        if let Some(urb) = self.urbs.get_mut(slot) {
            urb.channel = Some(channel);
        }
    }

    pub fn detach_channel(&mut self, slot: UrbSlot) {
        if let Some(urb) = self.urbs.get_mut(slot) {
            urb.channel = None;
        }
    }

    pub fn port_connected(&mut self, speed: Speed) {
        self.push_port(PortEvent::Connected(speed));
    }

    pub fn port_disconnected(&mut self) {
        self.push_port(PortEvent::Disconnected);
    }

    fn push_port(&mut self, event: PortEvent) {
        // 连接与断开成对出现，队满时旧事件已无意义
        if self.port_events.is_full() {
            warn!("port event queue full, dropping {:?}", self.port_events.pop_front());
        }
        let _ = self.port_events.push_back(event);
    }

    /// Hands the next OUT packet of `slot` to `write` and advances the URB.
    ///
    /// Returns the packet length; 0 means nothing is left to send, in which
    /// case `write` is not called.
    pub fn packet_out(&mut self, slot: UrbSlot, write: impl FnOnce(&[u8])) -> usize {
        let Some(urb) = self.urbs.get_mut(slot) else {
            return 0;
        };
        let len = urb.remaining().min(urb.transfer.ep_size as usize);
        if len == 0 {
            trace!("URB {} nothing more to transmit", urb.id().get());
            return 0;
        }
        let offset = packet_offset(urb);
        let per_packet = urb.transfer.flags.contains(TransferFlags::PER_PACKET_CALLBACK);

        let data = match urb.owner {
            Owner::Enumeration(dev) => {
                let Some(dev) = self.devices.get(dev) else {
                    return 0;
                };
                dev.scratch.get(offset..offset + len)
            }
            Owner::Application => {
                let hook = urb.transfer.on_packet.filter(|_| per_packet);
                let mut buffer = urb.transfer.buffer;
                if let (Some(hook), Some(region)) = (hook, buffer.region_mut(offset, len)) {
                    hook(Packet {
                        urb: urb.id(),
                        user_data: urb.transfer.user_data,
                        offset: urb.transferred,
                        data: PacketData::Out(region),
                    });
                }
                urb.transfer.buffer.region(offset, len)
            }
        };

        match data {
            Some(data) => write(data),
            None => {
                error!("URB {} buffer too small for OUT packet", urb.id().get());
                return 0;
            }
        }
        urb.transferred += len;
        len
    }

    /// Stores `len` received bytes of `slot`, produced by `read`.
    ///
    /// Fails with [`TransferError::Babble`] without calling `read` when the
    /// data does not fit the transfer.
    pub fn packet_in(
        &mut self,
        slot: UrbSlot,
        len: usize,
        read: impl FnOnce(&mut [u8]),
    ) -> Result<(), TransferError> {
        let Some(urb) = self.urbs.get_mut(slot) else {
            return Err(TransferError::Cancelled);
        };
        if len > urb.remaining() {
            warn!(
                "URB {} overflow: {} bytes with {} remaining",
                urb.id().get(),
                len,
                urb.remaining()
            );
            return Err(TransferError::Babble);
        }
        let offset = packet_offset(urb);

        match urb.owner {
            Owner::Enumeration(dev) => {
                let region = self
                    .devices
                    .get_mut(dev)
                    .and_then(|dev| dev.scratch.get_mut(offset..offset + len))
                    .ok_or(TransferError::Babble)?;
                read(region);
            }
            Owner::Application => {
                let mut buffer = urb.transfer.buffer;
                let region = buffer.region_mut(offset, len).ok_or(TransferError::Babble)?;
                read(&mut *region);
                let per_packet = urb.transfer.flags.contains(TransferFlags::PER_PACKET_CALLBACK);
                if let Some(hook) = urb.transfer.on_packet.filter(|_| per_packet) {
                    hook(Packet {
                        urb: urb.id(),
                        user_data: urb.transfer.user_data,
                        offset: urb.transferred,
                        data: PacketData::In(region),
                    });
                }
            }
        }
        urb.transferred += len;
        Ok(())
    }

    /// Finalizes the URB in `slot` and queues its completion.
    ///
    /// The backend must have released the hardware channel beforehand.
    pub fn complete(&mut self, slot: UrbSlot, result: Result<(), TransferError>) {
        let Some(urb) = self.urbs.free(slot) else {
            return;
        };
        let result: TransferResult = result.map(|_| urb.transferred);
        debug!("URB {} finished: {:?}", urb.id().get(), result);

        let callback = match urb.owner {
            Owner::Application => {
                let quiet = result.is_ok()
                    && urb.transfer.flags.contains(TransferFlags::NO_SUCCESS_CALLBACK);
                match urb.transfer.callback {
                    Some(cb) if !quiet => Some(cb),
                    _ => return,
                }
            }
            Owner::Enumeration(_) => None,
        };

        self.push_event(HostEvent::Transfer {
            owner: urb.owner,
            callback,
            completion: Completion {
                urb: Some(urb.id()),
                result,
                transfer: urb.transfer,
            },
        });
    }

    pub(crate) fn push_event(&mut self, event: HostEvent) {
        if self.events.push_back(event).is_err() {
            error!("host event queue overflow");
        }
    }
}

fn packet_offset(urb: &Urb) -> usize {
    if urb.transfer.flags.contains(TransferFlags::NO_MEMORY_INCREMENT) {
        0
    } else {
        urb.transferred
    }
}
