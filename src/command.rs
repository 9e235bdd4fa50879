//! The CTAP command layer (CTAP 2.0 §6.1): CBOR parameter-map assembly,
//! the leading command byte, dispatch through a [`Transport`], and
//! status-byte interpretation. Response *bodies* are never parsed here —
//! see the module doc on [`crate::ctap_ops`] for why.

use ciborium::value::Value;

use crate::cancel::CancellationToken;
use crate::error::{CtapError, Error, TransportError};
use crate::status::CtapStatus;
use crate::transport::Transport;

/// The CTAP2 command byte that prefixes every CBOR request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtapCommand {
    MakeCredential,
    GetAssertion,
    GetInfo,
    ClientPin,
    Reset,
    GetNextAssertion,
    CredentialManagement,
}

impl CtapCommand {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::MakeCredential => 0x01,
            Self::GetAssertion => 0x02,
            Self::GetInfo => 0x04,
            Self::ClientPin => 0x06,
            Self::Reset => 0x07,
            Self::GetNextAssertion => 0x08,
            Self::CredentialManagement => 0x0A,
        }
    }
}

/// Encode `params` (a CBOR map) and send it prefixed by `command`'s wire
/// byte, returning the response payload with its status byte stripped
/// and interpreted.
///
/// `device_name` is carried only for [`CtapError`]'s diagnostic message.
pub fn execute(
    transport: &dyn Transport,
    device_name: &str,
    command: CtapCommand,
    params: Option<Value>,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    let mut message = vec![command.to_byte()];
    if let Some(params) = params {
        let mut encoded = Vec::new();
        ciborium::into_writer(&params, &mut encoded)
            .map_err(|e| Error::Transport(TransportError::CborEncode(e.to_string())))?;
        message.extend_from_slice(&encoded);
    }

    let response = transport.send(&message, cancel)?;
    let status_byte = *response
        .first()
        .ok_or_else(|| Error::Transport(TransportError::Framing("empty CTAP response".to_string())))?;

    if status_byte == 0x00 {
        Ok(response[1..].to_vec())
    } else {
        Err(Error::Ctap(CtapError {
            status: CtapStatus::from_byte(status_byte),
            device_name: device_name.to_string(),
        }))
    }
}
