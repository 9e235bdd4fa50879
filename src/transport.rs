//! The `Transport` abstraction (CTAP 2.0 §8): one CTAP message in, one
//! CTAP response (status byte + payload) out, dispatched dynamically so
//! callers never need to know which physical transport an
//! [`crate::device::AuthenticatorHandle`] was opened over.
//!
//! Generalizes the teacher's free `send_hid`/`receive_hid`/`transmit_apdu`
//! functions (which each knew exactly one wire format) into a trait
//! object every command-layer caller can hold without a match on
//! transport kind.

use crate::cancel::CancellationToken;
use crate::ccid;
use crate::ctaphid;
use crate::error::Error;
use crate::pcsc_nfc;

/// A single physical or logical path to an authenticator. Every
/// implementation frames and, where the wire requires it, chains a raw
/// CTAP message (`CMD || params`) and returns the raw response
/// (`status_byte || payload`) unparsed.
pub trait Transport: Send {
    fn send(&self, message: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, Error>;

    /// Release any OS-level handle. Implementations that hold nothing
    /// beyond what `Drop` already releases may leave this empty.
    fn dispose(self: Box<Self>);
}

pub struct HidTransport {
    channel: ctaphid::Channel,
}

impl HidTransport {
    pub fn open(path: &str) -> Result<Self, crate::error::TransportError> {
        Ok(Self {
            channel: ctaphid::open(path)?,
        })
    }
}

impl Transport for HidTransport {
    fn send(&self, message: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
        self.channel.send_cbor(message, cancel)
    }

    fn dispose(self: Box<Self>) {}
}

pub struct PcscTransport {
    session: pcsc_nfc::Session,
}

impl PcscTransport {
    pub fn open(reader_name: &str) -> Result<Self, crate::error::TransportError> {
        Ok(Self {
            session: pcsc_nfc::open(reader_name)?,
        })
    }
}

impl Transport for PcscTransport {
    fn send(&self, message: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
        self.session.send(message, cancel)
    }

    fn dispose(self: Box<Self>) {}
}

pub struct CcidTransport {
    session: ccid::Session,
}

impl CcidTransport {
    pub fn open(bus_number: u8, address: u8) -> Result<Self, crate::error::TransportError> {
        Ok(Self {
            session: ccid::open(bus_number, address)?,
        })
    }
}

impl Transport for CcidTransport {
    fn send(&self, message: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
        self.session.send(message, cancel)
    }

    fn dispose(self: Box<Self>) {}
}
