use crate::transfer::EndpointType;

/// Final outcome of a transfer that did not succeed.
///
/// NAK is never reported here; the channel engine retries it.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    #[error("Timeout")]
    Timeout,
    #[error("Endpoint stalled")]
    Stall,
    #[error("Data toggle mismatch")]
    DataToggle,
    #[error("Babble detected")]
    Babble,
    #[error("Frame overrun")]
    FrameOverrun,
    #[error("Transaction error")]
    Transaction,
    #[error("Short packet")]
    ShortPacket,
    #[error("Cancelled")]
    Cancelled,
    #[error("No such device")]
    NoDevice,
    #[error("Resource unavailable")]
    ResourceUnavailable,
    #[error("Invalid request: {0}")]
    Invalid(#[from] InvalidRequest),
}

/// Why a transfer request was refused before reaching the hardware.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRequest {
    #[error("length {length} does not match setup wLength {setup}")]
    LengthMismatch { setup: u16, length: usize },
    #[error("control IN request without data stage")]
    EmptyControlIn,
    #[error("control transfer without setup packet")]
    MissingSetup,
    #[error("periodic transfer with zero interval")]
    ZeroInterval,
    #[error("{0:?} endpoint not allowed on low speed device")]
    LowSpeedEndpoint(EndpointType),
    #[error("endpoint max packet size is zero")]
    ZeroEndpointSize,
    #[error("buffer smaller than requested length")]
    BufferTooSmall,
    #[error("IN transfer into read-only buffer")]
    ReadOnlyBuffer,
    #[error("per packet callback requested without handler")]
    MissingPacketCallback,
}
