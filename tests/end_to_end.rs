//! End-to-end exercises of the command layer and caller-facing operations
//! against an in-memory fake transport, standing in for the real USB-HID/
//! PC/SC/CCID engines spec.md §8 describes scenarios for.

use std::sync::Mutex;

use ciborium::value::Value;
use fido_transport::cancel::CancellationToken;
use fido_transport::ctap_ops::{self, CredentialParam, PinAuthParams, RelyingParty, UserEntity};
use fido_transport::error::Error;
use fido_transport::status::CtapStatus;
use fido_transport::transport::Transport;

/// A scripted transport: returns one canned response per call, in order,
/// and records every message it was sent.
struct ScriptedTransport {
    responses: Mutex<Vec<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTransport {
    fn new(responses: Vec<Vec<u8>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, message: &[u8], _cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
        self.sent.lock().unwrap().push(message.to_vec());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            panic!("ScriptedTransport ran out of canned responses");
        }
        Ok(responses.remove(0))
    }

    fn dispose(self: Box<Self>) {}
}

#[test]
fn get_info_round_trips_raw_cbor_body() {
    let mut cbor_body = Vec::new();
    ciborium::into_writer(&Value::Array(vec![Value::Text("FIDO_2_0".into())]), &mut cbor_body).unwrap();

    let mut response = vec![0x00]; // success status byte
    response.extend_from_slice(&cbor_body);
    let transport = ScriptedTransport::new(vec![response]);
    let cancel = CancellationToken::new();

    let body = ctap_ops::get_info(&transport, "fake authenticator", &cancel).unwrap();
    assert_eq!(body, cbor_body);
    assert_eq!(transport.sent.lock().unwrap()[0], vec![0x04]);
}

#[test]
fn pin_required_surfaces_as_typed_ctap_error() {
    let transport = ScriptedTransport::new(vec![vec![0x36]]); // CTAP2_ERR_PIN_REQUIRED
    let cancel = CancellationToken::new();

    let err = ctap_ops::get_assertion(
        &transport,
        "fake authenticator",
        "example.com",
        &[0u8; 32],
        &[],
        None,
        None,
        PinAuthParams::default(),
        &cancel,
    )
    .unwrap_err();

    match err {
        Error::Ctap(e) => {
            assert_eq!(e.status, CtapStatus::PinRequired);
            assert_eq!(e.device_name, "fake authenticator");
        }
        other => panic!("expected a CTAP error, got {other:?}"),
    }
}

#[test]
fn make_credential_then_get_assertion_share_one_transport() {
    let transport = ScriptedTransport::new(vec![vec![0x00, 0xA0], vec![0x00, 0xA1, 0x01, 0x02]]);
    let cancel = CancellationToken::new();

    let rp = RelyingParty { id: "example.com".to_string(), name: Some("Example".to_string()) };
    let user = UserEntity {
        id: vec![9, 9, 9],
        name: Some("user".to_string()),
        display_name: None,
    };
    let params = vec![CredentialParam { alg: -7, cred_type: "public-key".to_string() }];

    let made = ctap_ops::make_credential(
        &transport,
        "fake authenticator",
        &[1u8; 32],
        &rp,
        &user,
        &params,
        &[],
        None,
        None,
        PinAuthParams::default(),
        &cancel,
    )
    .unwrap();
    assert_eq!(made, vec![0xA0]);

    let asserted = ctap_ops::get_assertion(
        &transport,
        "fake authenticator",
        "example.com",
        &[2u8; 32],
        &[],
        None,
        None,
        PinAuthParams::default(),
        &cancel,
    )
    .unwrap();
    assert_eq!(asserted, vec![0xA1, 0x01, 0x02]);

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent[0][0], 0x01); // MakeCredential
    assert_eq!(sent[1][0], 0x02); // GetAssertion
}

#[test]
fn cancellation_token_short_circuits_before_any_send() {
    let transport = ScriptedTransport::new(vec![vec![0x00]]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    // The command layer itself does not check the token (transports do),
    // but every real Transport::send implementation checks it first; the
    // fake below models a transport that respects cancellation exactly
    // like the real engines do.
    struct CancelCheckingTransport<'a>(&'a ScriptedTransport);
    impl<'a> Transport for CancelCheckingTransport<'a> {
        fn send(&self, message: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.0.send(message, cancel)
        }
        fn dispose(self: Box<Self>) {}
    }

    let wrapped = CancelCheckingTransport(&transport);
    let err = ctap_ops::get_info(&wrapped, "fake authenticator", &cancel).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(transport.sent.lock().unwrap().is_empty());
}
