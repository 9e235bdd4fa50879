//! Error families per the two-arm redesign: transport failures, CTAP
//! status failures, and a distinct cancellation indicator.

use crate::status::CtapStatus;
use thiserror::Error;

/// A failure at or below the transport boundary: OS I/O, framing
/// violations, handshake failures, or CCID/ISO-7816 protocol faults.
/// Non-recoverable at the core — callers see a descriptive message only.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device open failed, device present: {0}")]
    OpenFailedDevicePresent(String),

    #[error("device open failed, device not connected: {0}")]
    OpenFailedDeviceNotConnected(String),

    #[error("HID I/O error: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("CTAPHID INIT failed: {0}")]
    InitFailed(String),

    #[error("CTAPHID framing error: {0}")]
    Framing(String),

    #[error("APDU error: SW={sw1:02X}{sw2:02X}")]
    Apdu { sw1: u8, sw2: u8 },

    #[error("FIDO applet SELECT failed: SW={sw1:02X}{sw2:02X}")]
    AppletSelectFailed { sw1: u8, sw2: u8 },

    #[error("CCID reader error: {0}")]
    Ccid(String),

    #[error("CCID command failed (cmdStatus=failed)")]
    CcidCommandFailed,

    #[error("no card present")]
    NoCardPresent,

    #[error("CCID response matching exhausted without finding the expected message")]
    CcidResponseMatchExhausted,

    #[error("CCID time-extension loop exceeded its retry cap")]
    CcidTimeExtensionExceeded,

    #[error("CBOR encoding failed: {0}")]
    CborEncode(String),

    #[error("device {0} is not open")]
    DeviceNotOpen(String),

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("{0}")]
    Other(String),
}

/// A nonzero CTAP status byte. Meaningful to the application layer (e.g.
/// `PinRequired` should trigger a PIN-entry UX step) — this is not a
/// transport failure, it is a well-formed CTAP response the caller must
/// branch on.
#[derive(Debug, Error)]
#[error("CTAP error {status} from device \"{device_name}\"")]
pub struct CtapError {
    pub status: CtapStatus,
    pub device_name: String,
}

/// Top-level crate error: transport failure, CTAP status failure, or
/// cooperative cancellation. Exactly one of these three things can go
/// wrong with any operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Ctap(#[from] CtapError),

    #[error("operation aborted by cancellation token")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
