//! Device capability interface
//!
//! The wire protocol lives outside this crate. Anything that can open a
//! link to the controller and read by data-block address implements
//! [`DeviceClient`]; the rest of the pipeline only talks to this trait.

pub mod virt;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use virt::VirtualDevice;

/// Device-level errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Link could not be established
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// A read was issued without an open link
    #[error("Not connected to device")]
    NotConnected,

    /// The device rejected or failed a read
    #[error("Read failed at {address}: {reason}")]
    ReadFailed { address: String, reason: String },

    /// Address outside the device's data block
    #[error("Address out of range: {0}")]
    OutOfRange(String),

    /// Operation exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Read-by-address access to one controller
///
/// Methods take `&self`; implementations keep their link state behind
/// interior mutability so one client can be shared through an `Arc`.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Human-readable endpoint for logs (e.g. "192.168.0.10:102 rack=0 slot=1")
    fn endpoint(&self) -> String;

    /// Open the link
    ///
    /// `Ok(false)` means the handshake completed but the client still
    /// reports not-connected.
    async fn open(&self) -> DeviceResult<bool>;

    /// Close the link; no-op when already closed
    async fn close(&self);

    /// Whether the link is currently open
    fn is_connected(&self) -> bool;

    /// 4-byte IEEE float at (block, offset)
    async fn read_f32(&self, block: u16, offset: u32) -> DeviceResult<f32>;

    /// 2-byte signed integer at (block, offset)
    async fn read_i16(&self, block: u16, offset: u32) -> DeviceResult<i16>;

    /// Single bit at (block, offset, bit)
    async fn read_bit(&self, block: u16, offset: u32, bit: u8) -> DeviceResult<bool>;

    /// Raw bytes starting at (block, offset)
    async fn read_bytes(&self, block: u16, offset: u32, length: usize) -> DeviceResult<Vec<u8>>;
}
