use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Out,
    In,
}

/// Endpoint transfer type, numbered as in `bmAttributes` of the endpoint
/// descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EndpointType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointType {
    pub fn is_periodic(&self) -> bool {
        matches!(self, Self::Isochronous | Self::Interrupt)
    }
}

/// `bEndpointAddress`: bit 7 is the direction, bits 0..3 the number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    pub const CONTROL: Self = Self(0);

    pub fn new(number: u8, direction: Direction) -> Self {
        let dir = match direction {
            Direction::Out => 0,
            Direction::In => 0x80,
        };
        Self((number & 0x0f) | dir)
    }

    pub fn number(&self) -> u8 {
        self.0 & 0x0f
    }

    pub fn direction(&self) -> Direction {
        if self.0 & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn is_in(&self) -> bool {
        self.direction() == Direction::In
    }

    pub fn is_out(&self) -> bool {
        self.direction() == Direction::Out
    }
}

impl From<u8> for EndpointAddress {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Standard request codes (USB 2.0 table 9-4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Request {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
    #[num_enum(catch_all)]
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BmRequestType {
    pub direction: Direction,
    pub request_type: RequestType,
    pub recipient: Recipient,
}

impl BmRequestType {
    pub const fn new(
        direction: Direction,
        request_type: RequestType,
        recipient: Recipient,
    ) -> Self {
        Self {
            direction,
            request_type,
            recipient,
        }
    }
}

impl From<BmRequestType> for u8 {
    fn from(value: BmRequestType) -> Self {
        let dir = match value.direction {
            Direction::Out => 0,
            Direction::In => 0x80,
        };
        dir | ((value.request_type as u8) << 5) | value.recipient as u8
    }
}

/// The 8-byte SETUP stage payload of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const LEN: usize = 8;

    pub fn new(
        request_type: BmRequestType,
        request: Request,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: request_type.into(),
            request: request.into(),
            value,
            index,
            length,
        }
    }

    /// SET_ADDRESS to the default pipe.
    pub fn set_address(address: u8) -> Self {
        Self::new(
            BmRequestType::new(Direction::Out, RequestType::Standard, Recipient::Device),
            Request::SetAddress,
            address as u16,
            0,
            0,
        )
    }

    /// GET_DESCRIPTOR for a device-level descriptor.
    pub fn get_descriptor(desc_type: u8, desc_index: u8, language: u16, length: u16) -> Self {
        Self::new(
            BmRequestType::new(Direction::In, RequestType::Standard, Recipient::Device),
            Request::GetDescriptor,
            ((desc_type as u16) << 8) | desc_index as u16,
            language,
            length,
        )
    }

    /// Direction of the data stage, bit 7 of `bmRequestType`.
    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}
