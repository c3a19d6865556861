use crate::control_command::ControlPayload;
use std::time::Duration;

/// Bulk IN endpoint the firmware streams samples on.
pub const BULK_ENDPOINT_IN: u8 = 0x86;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("Device disconnected")]
    Disconnected,

    #[error("Endpoint 0x{endpoint:02x} stalled")]
    Stall { endpoint: u8 },

    #[error("Transfer timed out")]
    Timeout,

    #[error("USB transfer failed: {0}")]
    Other(String),
}

/// An opened oscilloscope, as seen by the acquisition engine.
///
/// Implementations wrap whatever USB stack the application uses. Both calls
/// block until the transfer completes or `timeout` elapses.
pub trait UsbTransport: Send {
    fn control_out(
        &mut self,
        payload: &ControlPayload,
        timeout: Duration,
    ) -> Result<(), TransferError>;

    /// Read one bulk transfer of up to `length` bytes.
    fn bulk_in(
        &mut self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransferError>;
}
