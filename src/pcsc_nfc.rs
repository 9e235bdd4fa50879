//! PC/SC transport (CTAP 2.0 §8.2 / ISO-DEP over NFC): reader discovery,
//! FIDO applet selection, and the APDU exchange.
//!
//! Grounded on the teacher's `transport::transmit_apdu` and
//! `device::enumerate_ccid_devices`, generalized from the Feitian reader
//! name filter to any PC/SC reader and from ad-hoc length checks to the
//! shared [`crate::apdu`] chaining state machine.

use crate::apdu;
use crate::cancel::CancellationToken;
use crate::error::{Error, TransportError};

/// A PC/SC reader, not yet connected to a card.
#[derive(Debug, Clone)]
pub struct PcscReaderInfo {
    pub name: String,
}

/// List every reader the PC/SC subsystem knows about.
pub fn discover() -> Result<Vec<PcscReaderInfo>, TransportError> {
    let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
    let readers_buf = ctx.list_readers_owned()?;
    Ok(readers_buf
        .iter()
        .map(|name| PcscReaderInfo {
            name: name.to_string_lossy().to_string(),
        })
        .collect())
}

/// An open PC/SC session against one reader. Each [`send`](Session::send)
/// call connects, selects the FIDO applet, exchanges the message, and
/// disconnects — matching the spec's "every exchange reconnects" model so
/// a card removed between calls surfaces as [`TransportError::NoCardPresent`]
/// rather than a stale handle.
pub struct Session {
    context: pcsc::Context,
    reader_name: std::ffi::CString,
}

pub fn open(reader_name: &str) -> Result<Session, TransportError> {
    let context = pcsc::Context::establish(pcsc::Scope::User)?;
    let reader_name = std::ffi::CString::new(reader_name)
        .map_err(|_| TransportError::DeviceNotFound(reader_name.to_string()))?;
    Ok(Session {
        context,
        reader_name,
    })
}

impl Session {
    pub fn send(&self, message: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        log::debug!("PC/SC connect");
        let card = self
            .context
            .connect(&self.reader_name, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)
            .map_err(classify_connect_error)?;

        let result = (|| -> Result<Vec<u8>, Error> {
            select_fido_applet(&card)?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            send_ctap(&card, message).map_err(Error::Transport)
        })();

        log::debug!("PC/SC disconnect (leave card)");
        let _ = card.disconnect(pcsc::Disposition::LeaveCard);
        result
    }
}

fn classify_connect_error(error: pcsc::Error) -> Error {
    match error {
        pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard => {
            Error::Transport(TransportError::NoCardPresent)
        }
        other => Error::Transport(TransportError::Pcsc(other)),
    }
}

/// SW 0x9000 means the FIDO applet is selected; anything else is a
/// selection failure.
fn is_applet_selected(sw1: u8, sw2: u8) -> bool {
    (sw1, sw2) == (0x90, 0x00)
}

fn select_fido_applet(card: &pcsc::Card) -> Result<(), Error> {
    let select = apdu::build_select_fido_apdu();
    let response = transmit(card, &select).map_err(Error::Transport)?;
    let (_, sw1, sw2) = apdu::split_response(&response).map_err(Error::Transport)?;
    if !is_applet_selected(sw1, sw2) {
        log::warn!("FIDO applet SELECT failed: SW={sw1:02X}{sw2:02X}");
        return Err(Error::Transport(TransportError::AppletSelectFailed { sw1, sw2 }));
    }
    Ok(())
}

fn send_ctap(card: &pcsc::Card, message: &[u8]) -> Result<Vec<u8>, TransportError> {
    apdu::send_ctap_message(message, |single_apdu| transmit(card, single_apdu))
}

fn transmit(card: &pcsc::Card, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
    log::trace!("APDU >> {apdu:02X?}");
    let mut response_buf = vec![0u8; pcsc::MAX_BUFFER_SIZE];
    let response = card.transmit(apdu, &mut response_buf)?;
    log::trace!("APDU << {response:02X?}");
    Ok(response.to_vec())
}
