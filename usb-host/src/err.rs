pub use usb_if::err::{InvalidRequest, TransferError};
pub use usb_if::host::USBError;

pub type Result<T = ()> = core::result::Result<T, USBError>;

/// Outcome reported for a finished URB: bytes moved, or why it stopped.
pub type TransferResult = core::result::Result<usize, TransferError>;
