use core::ptr::NonNull;

use bitflags::bitflags;
use usb_if::{
    Speed,
    err::InvalidRequest,
    transfer::{Direction, EndpointAddress, EndpointType, SetupPacket},
};

use crate::{HostHandle, device::DeviceId, err::TransferResult, urb::UrbId};

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct TransferFlags: u8 {
        /// OUT 传输长度为端点包大小整数倍时追加零长包
        const ZERO_PACKET = 1 << 0;
        /// 收到短包视为错误
        const NO_SHORT_PACKET = 1 << 1;
        /// 每个数据包都调用 `on_packet`
        const PER_PACKET_CALLBACK = 1 << 2;
        /// 每个包都使用缓冲区起始位置
        const NO_MEMORY_INCREMENT = 1 << 3;
        /// 成功时不调用完成回调
        const NO_SUCCESS_CALLBACK = 1 << 4;
    }
}

/// 传输完成回调
pub type TransferCallback = fn(host: &mut dyn HostHandle, completion: &Completion);

/// 逐包回调
pub type PacketCallback = fn(packet: Packet<'_>);

pub struct Completion {
    /// `None` when the request was refused before an URB existed.
    pub urb: Option<UrbId>,
    pub result: TransferResult,
    pub transfer: Transfer,
}

pub struct Packet<'a> {
    pub urb: UrbId,
    pub user_data: usize,
    /// Offset of this packet from the start of the transfer.
    pub offset: usize,
    pub data: PacketData<'a>,
}

pub enum PacketData<'a> {
    /// Just received from the device.
    In(&'a [u8]),
    /// About to be sent, may be filled in place.
    Out(&'a mut [u8]),
}

/// Caller memory a transfer reads from or writes into.
///
/// The engine keeps only the raw pointer; the memory has to stay valid and
/// untouched by the caller until the completion callback has run.
#[derive(Debug, Clone, Copy)]
pub struct DataBuffer {
    ptr: NonNull<u8>,
    len: usize,
    writable: bool,
}

unsafe impl Send for DataBuffer {}

impl DataBuffer {
    pub const fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
            writable: true,
        }
    }

    pub fn new(buf: &'static mut [u8]) -> Self {
        let len = buf.len();
        Self {
            ptr: NonNull::from(buf).cast(),
            len,
            writable: true,
        }
    }

    /// Read-only data, usable for OUT transfers only.
    pub fn from_static(buf: &'static [u8]) -> Self {
        Self {
            ptr: NonNull::from(buf).cast(),
            len: buf.len(),
            writable: false,
        }
    }

    /// # Safety
    ///
    /// `ptr..ptr+len` must stay valid (and writable if `writable`) and must
    /// not be accessed by anyone else until the transfer has completed.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize, writable: bool) -> Self {
        Self { ptr, len, writable }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// # Safety
    ///
    /// No mutable access to the buffer may be live, which holds once the
    /// transfer using it has completed.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn region(&self, offset: usize, len: usize) -> Option<&[u8]> {
        if offset.checked_add(len)? > self.len {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) })
    }

    pub(crate) fn region_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        if !self.writable || offset.checked_add(len)? > self.len {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len) })
    }
}

/// 一次传输请求
#[derive(Clone)]
pub struct Transfer {
    pub device: DeviceId,
    pub ep_type: EndpointType,
    pub ep_address: EndpointAddress,
    pub ep_size: u16,
    /// 仅控制传输
    pub setup: Option<SetupPacket>,
    pub buffer: DataBuffer,
    pub length: usize,
    pub flags: TransferFlags,
    /// 周期传输的间隔，单位帧
    pub interval: u16,
    /// 毫秒，0 表示永不超时
    pub timeout_ms: u32,
    pub callback: Option<TransferCallback>,
    pub on_packet: Option<PacketCallback>,
    pub user_data: usize,
}

impl Transfer {
    fn new(
        device: DeviceId,
        ep_type: EndpointType,
        ep_address: EndpointAddress,
        ep_size: u16,
        buffer: DataBuffer,
        length: usize,
    ) -> Self {
        Self {
            device,
            ep_type,
            ep_address,
            ep_size,
            setup: None,
            buffer,
            length,
            flags: TransferFlags::empty(),
            interval: 0,
            timeout_ms: 0,
            callback: None,
            on_packet: None,
            user_data: 0,
        }
    }

    /// Control transfer on the default pipe; the data stage length is taken
    /// from `setup.length`.
    pub fn control(device: DeviceId, ep_size: u16, setup: SetupPacket, buffer: DataBuffer) -> Self {
        let mut transfer = Self::new(
            device,
            EndpointType::Control,
            EndpointAddress::CONTROL,
            ep_size,
            buffer,
            setup.length as usize,
        );
        transfer.setup = Some(setup);
        transfer
    }

    pub fn bulk(
        device: DeviceId,
        ep_address: EndpointAddress,
        ep_size: u16,
        buffer: DataBuffer,
        length: usize,
    ) -> Self {
        Self::new(device, EndpointType::Bulk, ep_address, ep_size, buffer, length)
    }

    pub fn interrupt(
        device: DeviceId,
        ep_address: EndpointAddress,
        ep_size: u16,
        interval: u16,
        buffer: DataBuffer,
        length: usize,
    ) -> Self {
        let mut transfer = Self::new(
            device,
            EndpointType::Interrupt,
            ep_address,
            ep_size,
            buffer,
            length,
        );
        transfer.interval = interval;
        transfer
    }

    pub fn isochronous(
        device: DeviceId,
        ep_address: EndpointAddress,
        ep_size: u16,
        interval: u16,
        buffer: DataBuffer,
        length: usize,
    ) -> Self {
        let mut transfer = Self::new(
            device,
            EndpointType::Isochronous,
            ep_address,
            ep_size,
            buffer,
            length,
        );
        transfer.interval = interval;
        transfer
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    pub fn with_flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_callback(mut self, callback: TransferCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_packet_callback(mut self, on_packet: PacketCallback) -> Self {
        self.on_packet = Some(on_packet);
        self.flags |= TransferFlags::PER_PACKET_CALLBACK;
        self
    }

    pub fn with_user_data(mut self, user_data: usize) -> Self {
        self.user_data = user_data;
        self
    }

    /// Direction of the data stage.
    pub fn direction(&self) -> Direction {
        match (self.ep_type, &self.setup) {
            (EndpointType::Control, Some(setup)) => setup.direction(),
            _ => self.ep_address.direction(),
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.ep_type.is_periodic()
    }

    /// Shape checks that do not depend on caller memory.
    pub(crate) fn validate_shape(&self, speed: Speed) -> Result<(), InvalidRequest> {
        if self.ep_size == 0 {
            return Err(InvalidRequest::ZeroEndpointSize);
        }

        match self.ep_type {
            EndpointType::Control => {
                let setup = self.setup.ok_or(InvalidRequest::MissingSetup)?;
                if self.length != setup.length as usize {
                    return Err(InvalidRequest::LengthMismatch {
                        setup: setup.length,
                        length: self.length,
                    });
                }
                if setup.direction() == Direction::In && self.length == 0 {
                    return Err(InvalidRequest::EmptyControlIn);
                }
            }
            EndpointType::Interrupt | EndpointType::Isochronous if self.interval == 0 => {
                return Err(InvalidRequest::ZeroInterval);
            }
            _ => {}
        }

        if speed == Speed::Low
            && matches!(self.ep_type, EndpointType::Bulk | EndpointType::Isochronous)
        {
            return Err(InvalidRequest::LowSpeedEndpoint(self.ep_type));
        }

        if self.flags.contains(TransferFlags::PER_PACKET_CALLBACK) && self.on_packet.is_none() {
            return Err(InvalidRequest::MissingPacketCallback);
        }

        Ok(())
    }

    /// Checks that the caller buffer can back the transfer.
    pub(crate) fn validate_buffer(&self) -> Result<(), InvalidRequest> {
        let needed = if self.flags.contains(TransferFlags::NO_MEMORY_INCREMENT) {
            self.length.min(self.ep_size as usize)
        } else {
            self.length
        };
        if self.buffer.len() < needed {
            return Err(InvalidRequest::BufferTooSmall);
        }

        let needs_write = self.direction() == Direction::In
            || self.flags.contains(TransferFlags::PER_PACKET_CALLBACK);
        if needs_write && needed > 0 && !self.buffer.is_writable() {
            return Err(InvalidRequest::ReadOnlyBuffer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use usb_if::transfer::{BmRequestType, Recipient, Request, RequestType};

    use super::*;
    use crate::device::DeviceRegistry;

    fn device() -> DeviceId {
        DeviceRegistry::new().insert(None, 0, Speed::Full).unwrap()
    }

    fn get_status(length: u16) -> SetupPacket {
        SetupPacket::new(
            BmRequestType::new(Direction::In, RequestType::Standard, Recipient::Device),
            Request::GetStatus,
            0,
            0,
            length,
        )
    }

    #[test]
    fn control_length_must_match_setup() {
        let t = Transfer::control(device(), 8, get_status(2), DataBuffer::empty()).with_length(4);
        assert_eq!(
            t.validate_shape(Speed::Full),
            Err(InvalidRequest::LengthMismatch { setup: 2, length: 4 })
        );
        let t = Transfer::control(device(), 8, get_status(2), DataBuffer::empty());
        assert_eq!(t.validate_shape(Speed::Full), Ok(()));
    }

    #[test]
    fn control_in_needs_data_stage() {
        let t = Transfer::control(device(), 8, get_status(0), DataBuffer::empty());
        assert_eq!(t.validate_shape(Speed::Full), Err(InvalidRequest::EmptyControlIn));
        let t = Transfer::control(device(), 8, SetupPacket::set_address(3), DataBuffer::empty());
        assert_eq!(t.validate_shape(Speed::Full), Ok(()));
    }

    #[test]
    fn periodic_needs_interval() {
        let t = Transfer::interrupt(device(), EndpointAddress(0x81), 8, 0, DataBuffer::empty(), 0);
        assert_eq!(t.validate_shape(Speed::Full), Err(InvalidRequest::ZeroInterval));
    }

    #[test]
    fn low_speed_rejects_bulk() {
        let t = Transfer::bulk(device(), EndpointAddress(0x02), 8, DataBuffer::empty(), 0);
        assert_eq!(
            t.validate_shape(Speed::Low),
            Err(InvalidRequest::LowSpeedEndpoint(EndpointType::Bulk))
        );
        let t = Transfer::interrupt(device(), EndpointAddress(0x81), 8, 10, DataBuffer::empty(), 0);
        assert_eq!(t.validate_shape(Speed::Low), Ok(()));
    }

    #[test]
    fn in_transfer_needs_writable_buffer() {
        static DATA: [u8; 16] = [0; 16];
        let data = || DataBuffer::from_static(&DATA);
        let t = Transfer::bulk(device(), EndpointAddress(0x81), 8, data(), 16);
        assert_eq!(t.validate_buffer(), Err(InvalidRequest::ReadOnlyBuffer));
        let t = Transfer::bulk(device(), EndpointAddress(0x01), 8, data(), 16);
        assert_eq!(t.validate_buffer(), Ok(()));
        let t = Transfer::bulk(device(), EndpointAddress(0x01), 8, data(), 32);
        assert_eq!(t.validate_buffer(), Err(InvalidRequest::BufferTooSmall));
    }

    #[test]
    fn no_memory_increment_needs_one_packet() {
        let buf = DataBuffer::new(Box::leak(Box::new([0u8; 8])));
        let t = Transfer::bulk(device(), EndpointAddress(0x81), 8, buf, 64)
            .with_flags(TransferFlags::NO_MEMORY_INCREMENT);
        assert_eq!(t.validate_buffer(), Ok(()));
    }

    #[test]
    fn packet_flag_needs_handler() {
        let t = Transfer::bulk(device(), EndpointAddress(0x81), 8, DataBuffer::empty(), 0)
            .with_flags(TransferFlags::PER_PACKET_CALLBACK);
        assert_eq!(
            t.validate_shape(Speed::Full),
            Err(InvalidRequest::MissingPacketCallback)
        );
    }
}
