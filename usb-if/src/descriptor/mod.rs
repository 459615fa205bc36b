/// `bDescriptorType` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorType(pub u8);

impl DescriptorType {
    pub const DEVICE: Self = Self(1);
    pub const CONFIGURATION: Self = Self(2);
    pub const STRING: Self = Self(3);
    pub const INTERFACE: Self = Self(4);
    pub const ENDPOINT: Self = Self(5);
}

/// 设备描述符的前 8 字节，枚举阶段只读取这一部分以获知 ep0 包大小。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptorHeader {
    pub length: u8,
    pub descriptor_type: u8,
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size_0: u8,
}

impl DeviceDescriptorHeader {
    pub const LEN: usize = 8;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN || data[1] != DescriptorType::DEVICE.0 {
            return None;
        }
        Some(Self {
            length: data[0],
            descriptor_type: data[1],
            usb_version: u16::from_le_bytes([data[2], data[3]]),
            class: data[4],
            subclass: data[5],
            protocol: data[6],
            max_packet_size_0: data[7],
        })
    }

    /// 8, 16, 32 或 64 (USB 2.0 §9.6.1)
    pub fn max_packet_size_valid(&self) -> bool {
        matches!(self.max_packet_size_0, 8 | 16 | 32 | 64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_header() {
        let raw = [18, 1, 0x00, 0x02, 0, 0, 0, 64];
        let desc = DeviceDescriptorHeader::parse(&raw).unwrap();
        assert_eq!(desc.usb_version, 0x0200);
        assert_eq!(desc.max_packet_size_0, 64);
        assert!(desc.max_packet_size_valid());
    }

    #[test]
    fn reject_bad_header() {
        assert!(DeviceDescriptorHeader::parse(&[18, 2, 0, 2, 0, 0, 0, 8]).is_none());
        assert!(DeviceDescriptorHeader::parse(&[18, 1, 0]).is_none());
        let odd = DeviceDescriptorHeader::parse(&[18, 1, 0, 2, 0, 0, 0, 12]).unwrap();
        assert!(!odd.max_packet_size_valid());
    }
}
