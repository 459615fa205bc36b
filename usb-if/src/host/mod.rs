use crate::err::TransferError;

/// Bus speed of an attached device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Speed {
    #[default]
    Unknown,
    Low,
    Full,
    High,
}

impl Speed {
    /// Default control endpoint packet size before the device descriptor
    /// has been read (USB 2.0 §5.5.3).
    pub fn default_ep0_size(&self) -> u16 {
        match self {
            Speed::High => 64,
            _ => 8,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum USBError {
    #[error("Timeout")]
    Timeout,
    #[error("Transfer error: {0}")]
    TransferError(#[from] TransferError),
    #[error("Not found")]
    NotFound,
    #[error("Not supported")]
    NotSupported,
}
