//! Authenticator discovery and the handle callers operate through.
//!
//! Generalizes the teacher's `Device`/`DeviceManager` (Feitian-only,
//! HID-or-CCID) into a transport-agnostic descriptor list ordered
//! USB-HID, then PC/SC, then raw CCID, and a single `open` entry point
//! that returns a boxed [`Transport`] no matter which of the three it is.

use crate::ccid;
use crate::ctaphid;
use crate::error::TransportError;
use crate::pcsc_nfc;
use crate::transport::{CcidTransport, HidTransport, PcscTransport, Transport};

/// Which physical medium an [`AuthenticatorDescriptor`] was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Usb,
    Nfc,
}

/// A discovered authenticator, not yet opened.
pub struct AuthenticatorDescriptor {
    pub name: String,
    pub kind: TransportKind,
    locator: Locator,
}

enum Locator {
    Hid { path: String },
    Pcsc { reader_name: String },
    Ccid { bus_number: u8, address: u8 },
}

/// Enumerate every authenticator reachable through USB-HID, PC/SC, or raw
/// CCID, in that order. PC/SC and CCID over the same physical reader are
/// not deduplicated here: a caller choosing one closes the question a
/// real device would answer by whichever it opens first.
pub fn discover() -> Result<Vec<AuthenticatorDescriptor>, TransportError> {
    let mut descriptors = Vec::new();

    for info in ctaphid::discover()? {
        descriptors.push(AuthenticatorDescriptor {
            name: info
                .product_name
                .clone()
                .unwrap_or_else(|| format!("USB-HID {:04x}:{:04x}", info.vendor_id, info.product_id)),
            kind: TransportKind::Usb,
            locator: Locator::Hid { path: info.path },
        });
    }

    match pcsc_nfc::discover() {
        Ok(readers) => {
            for reader in readers {
                descriptors.push(AuthenticatorDescriptor {
                    name: reader.name.clone(),
                    kind: TransportKind::Nfc,
                    locator: Locator::Pcsc { reader_name: reader.name },
                });
            }
        }
        Err(e) => log::warn!("PC/SC discovery unavailable: {e}"),
    }

    match ccid::discover() {
        Ok(devices) => {
            for d in devices {
                descriptors.push(AuthenticatorDescriptor {
                    name: format!("USB CCID {:04x}:{:04x}", d.vendor_id, d.product_id),
                    kind: TransportKind::Usb,
                    locator: Locator::Ccid {
                        bus_number: d.bus_number,
                        address: d.address,
                    },
                });
            }
        }
        Err(e) => log::warn!("raw CCID discovery unavailable: {e}"),
    }

    Ok(descriptors)
}

/// Open a transport for `descriptor`, returning it boxed for dynamic
/// dispatch alongside an [`AuthenticatorHandle`] wrapper that carries the
/// display name used in [`crate::error::CtapError`] messages.
pub fn open(descriptor: &AuthenticatorDescriptor) -> Result<AuthenticatorHandle, TransportError> {
    let transport: Box<dyn Transport> = match &descriptor.locator {
        Locator::Hid { path } => Box::new(HidTransport::open(path)?),
        Locator::Pcsc { reader_name } => Box::new(PcscTransport::open(reader_name)?),
        Locator::Ccid { bus_number, address } => Box::new(CcidTransport::open(*bus_number, *address)?),
    };

    Ok(AuthenticatorHandle {
        transport: Some(transport),
        name: descriptor.name.clone(),
        kind: descriptor.kind,
    })
}

/// An open authenticator. Holds a boxed [`Transport`] so USB-HID, PC/SC,
/// and raw-CCID authenticators are indistinguishable past this point.
pub struct AuthenticatorHandle {
    transport: Option<Box<dyn Transport>>,
    name: String,
    kind: TransportKind,
}

impl AuthenticatorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport
            .as_deref()
            .expect("transport is only taken by close(), which consumes the handle")
    }

    /// Explicitly release the underlying transport. Equivalent to letting
    /// the handle drop, except [`Transport::dispose`] runs eagerly rather
    /// than during unwind.
    pub fn close(mut self) {
        if let Some(transport) = self.transport.take() {
            transport.dispose();
        }
    }
}

impl Drop for AuthenticatorHandle {
    fn drop(&mut self) {
        log::debug!("closing authenticator handle \"{}\"", self.name);
        if let Some(transport) = self.transport.take() {
            transport.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_does_not_panic_without_hardware() {
        let result = discover();
        assert!(result.is_ok());
    }
}
