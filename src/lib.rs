//! Transport-framing and command-chaining engine for FIDO2/CTAP 2.0
//! authenticators over USB-HID and NFC (PC/SC, raw CCID).
//!
//! This crate owns everything below the CBOR response body: packet
//! framing, command chaining, status-byte interpretation, and device
//! discovery. It does not perform PIN-protocol cryptography and it does
//! not parse CBOR response payloads — both are left to the caller. See
//! [`ctap_ops`] for the operation-level API.

pub mod apdu;
pub mod cancel;
pub mod ccid;
pub mod command;
pub mod ctap_ops;
pub mod ctaphid;
pub mod device;
pub mod error;
pub mod pcsc_nfc;
pub mod status;
pub mod transport;

pub use cancel::CancellationToken;
pub use device::{discover, open, AuthenticatorDescriptor, AuthenticatorHandle, TransportKind};
pub use error::{CtapError, Error, Result, TransportError};
pub use status::CtapStatus;
pub use transport::Transport;
