//! 枚举流程：分配地址 → SET_ADDRESS → 读取设备描述符前 8 字节 → 通知应用
//!
//! 每一步都是一个由主机拥有的控制传输，完成后在事件派发中推进到下一步。
//! 任何一步失败都直接移除设备，应用不会看到它。

use core::fmt::Display;

use usb_if::{
    descriptor::{DescriptorType, DeviceDescriptorHeader},
    transfer::SetupPacket,
};

use crate::{
    USBHost,
    backend::ty::{
        HostOp,
        transfer::{Completion, DataBuffer, Transfer},
    },
    bus::HostEvent,
    device::DeviceId,
    urb::Owner,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationStage {
    #[default]
    Start,
    AddressAllocated,
    SettingAddress,
    ReadingDescriptor,
    Done,
}

pub(crate) fn start<B: HostOp>(host: &mut USBHost<B>, dev: DeviceId) {
    let devices = &mut host.bus_mut().devices;
    let Some(address) = devices.allocate_address() else {
        fail(host, dev, "no free address");
        return;
    };
    let Some(device) = devices.get_mut(dev) else {
        return;
    };
    device.pending_address = address;
    device.stage = EnumerationStage::AddressAllocated;
    debug!("device {:?}: address {} allocated", dev, address);

    let transfer = Transfer::control(
        dev,
        device.ep0_max_packet_size(),
        SetupPacket::set_address(address),
        DataBuffer::empty(),
    );
    submit_step(host, dev, transfer, EnumerationStage::SettingAddress);
}

pub(crate) fn on_complete<B: HostOp>(
    host: &mut USBHost<B>,
    dev: DeviceId,
    completion: &Completion,
) {
    let Some(device) = host
        .bus_mut()
        .devices
        .get_mut(dev)
        .filter(|d| !d.disconnecting)
    else {
        // 设备已断开
        return;
    };

    let len = match completion.result {
        Ok(len) => len,
        Err(err) => {
            fail(host, dev, err);
            return;
        }
    };

    match device.stage {
        EnumerationStage::SettingAddress => {
            device.address = device.pending_address;
            info!("device {:?}: address {}", dev, device.address);

            let setup = SetupPacket::get_descriptor(
                DescriptorType::DEVICE.0,
                0,
                0,
                DeviceDescriptorHeader::LEN as u16,
            );
            let transfer = Transfer::control(
                dev,
                device.ep0_max_packet_size(),
                setup,
                DataBuffer::empty(),
            );
            submit_step(host, dev, transfer, EnumerationStage::ReadingDescriptor);
        }
        EnumerationStage::ReadingDescriptor => {
            let header = device
                .scratch
                .get(..len)
                .and_then(DeviceDescriptorHeader::parse);
            match header {
                Some(header) if header.max_packet_size_valid() => {
                    device.ep0_size = header.max_packet_size_0 as u16;
                    device.stage = EnumerationStage::Done;
                    info!(
                        "device {:?}: enumerated, USB {:x}.{:02x}, ep0 {} bytes",
                        dev,
                        header.usb_version >> 8,
                        header.usb_version & 0xff,
                        device.ep0_size
                    );
                    host.bus_mut().push_event(HostEvent::Connected(dev));
                }
                Some(header) => fail(
                    host,
                    dev,
                    format_args!("invalid bMaxPacketSize0 {}", header.max_packet_size_0),
                ),
                None => fail(host, dev, "malformed device descriptor"),
            }
        }
        stage => warn!("device {:?}: unexpected completion in {:?}", dev, stage),
    }
}

fn submit_step<B: HostOp>(
    host: &mut USBHost<B>,
    dev: DeviceId,
    transfer: Transfer,
    next: EnumerationStage,
) {
    if let Some(device) = host.bus_mut().devices.get_mut(dev) {
        device.stage = next;
    }
    if let Err(err) = host.submit(transfer, Owner::Enumeration(dev)) {
        fail(host, dev, err);
    }
}

fn fail<B: HostOp>(host: &mut USBHost<B>, dev: DeviceId, reason: impl Display) {
    warn!("device {:?}: enumeration failed: {}", dev, reason);
    host.disconnect(dev);
}
