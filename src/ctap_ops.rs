//! Caller-facing CTAP2 operations (CTAP 2.0 §6): one function per
//! authenticator command, each assembling the CBOR parameter map and
//! handing it to [`crate::command::execute`].
//!
//! Two things this module deliberately does NOT do, unlike the teacher's
//! `fido2.rs`:
//!
//! - No cryptography. ECDH key agreement, AES encryption of PIN material,
//!   and HMAC-SHA256 pinAuth computation are the caller's job; every
//!   already-encrypted or already-authenticated byte string here
//!   (`pin_hash_enc`, `new_pin_enc`, `pin_auth`) is taken as an opaque
//!   `&[u8]` produced upstream.
//! - No response parsing. Every function returns the CBOR response body
//!   as raw bytes; decoding `authData`, COSE keys, or credential lists is
//!   left to the caller.

use ciborium::value::Value;

use crate::cancel::CancellationToken;
use crate::command::{self, CtapCommand};
use crate::error::Error;
use crate::transport::Transport;

fn int(key: i64) -> Value {
    Value::Integer(key.into())
}

fn map(pairs: Vec<(i64, Value)>) -> Value {
    Value::Map(pairs.into_iter().map(|(k, v)| (int(k), v)).collect())
}

fn bytes(data: &[u8]) -> Value {
    Value::Bytes(data.to_vec())
}

/// GetInfo (0x04): no parameters.
pub fn get_info(
    transport: &dyn Transport,
    device_name: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    command::execute(transport, device_name, CtapCommand::GetInfo, None, cancel)
}

/// authenticatorReset (0x07): no parameters.
pub fn reset(
    transport: &dyn Transport,
    device_name: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    command::execute(transport, device_name, CtapCommand::Reset, None, cancel)
}

/// authenticatorGetNextAssertion (0x08): no parameters.
pub fn get_next_assertion(
    transport: &dyn Transport,
    device_name: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    command::execute(transport, device_name, CtapCommand::GetNextAssertion, None, cancel)
}

const CLIENT_PIN_GET_RETRIES: i64 = 0x01;
const CLIENT_PIN_GET_KEY_AGREEMENT: i64 = 0x02;
const CLIENT_PIN_SET_PIN: i64 = 0x03;
const CLIENT_PIN_CHANGE_PIN: i64 = 0x04;
const CLIENT_PIN_GET_PIN_TOKEN: i64 = 0x05;

fn client_pin(
    transport: &dyn Transport,
    device_name: &str,
    sub_command: i64,
    pin_protocol: u8,
    extra: Vec<(i64, Value)>,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    let mut pairs = vec![(1, int(pin_protocol as i64)), (2, int(sub_command))];
    pairs.extend(extra);
    command::execute(transport, device_name, CtapCommand::ClientPin, Some(map(pairs)), cancel)
}

/// ClientPin subCommand 0x01: getPinRetries.
pub fn get_pin_retries(
    transport: &dyn Transport,
    device_name: &str,
    pin_protocol: u8,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    client_pin(transport, device_name, CLIENT_PIN_GET_RETRIES, pin_protocol, vec![], cancel)
}

/// ClientPin subCommand 0x02: getKeyAgreement. Returns the authenticator's
/// COSE public key; the caller performs ECDH against it.
pub fn get_key_agreement(
    transport: &dyn Transport,
    device_name: &str,
    pin_protocol: u8,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    client_pin(
        transport,
        device_name,
        CLIENT_PIN_GET_KEY_AGREEMENT,
        pin_protocol,
        vec![],
        cancel,
    )
}

/// ClientPin subCommand 0x03: setPIN. `key_agreement` is the platform's
/// COSE public key sent alongside the shared secret; `new_pin_enc` and
/// `pin_auth` are produced by the caller's PIN protocol implementation.
pub fn set_pin(
    transport: &dyn Transport,
    device_name: &str,
    pin_protocol: u8,
    key_agreement: Value,
    new_pin_enc: &[u8],
    pin_auth: &[u8],
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    client_pin(
        transport,
        device_name,
        CLIENT_PIN_SET_PIN,
        pin_protocol,
        vec![(3, key_agreement), (5, bytes(new_pin_enc)), (4, bytes(pin_auth))],
        cancel,
    )
}

/// ClientPin subCommand 0x04: changePIN.
pub fn change_pin(
    transport: &dyn Transport,
    device_name: &str,
    pin_protocol: u8,
    key_agreement: Value,
    pin_hash_enc: &[u8],
    new_pin_enc: &[u8],
    pin_auth: &[u8],
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    client_pin(
        transport,
        device_name,
        CLIENT_PIN_CHANGE_PIN,
        pin_protocol,
        vec![
            (3, key_agreement),
            (6, bytes(pin_hash_enc)),
            (5, bytes(new_pin_enc)),
            (4, bytes(pin_auth)),
        ],
        cancel,
    )
}

/// ClientPin subCommand 0x05: getPinToken.
pub fn get_pin_token(
    transport: &dyn Transport,
    device_name: &str,
    pin_protocol: u8,
    key_agreement: Value,
    pin_hash_enc: &[u8],
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    client_pin(
        transport,
        device_name,
        CLIENT_PIN_GET_PIN_TOKEN,
        pin_protocol,
        vec![(3, key_agreement), (6, bytes(pin_hash_enc))],
        cancel,
    )
}

/// A relying party identifier, CTAP map keys `id`/`name`.
pub struct RelyingParty {
    pub id: String,
    pub name: Option<String>,
}

/// A user entity, CTAP map keys `id`/`name`/`displayName`.
pub struct UserEntity {
    pub id: Vec<u8>,
    pub name: Option<String>,
    pub display_name: Option<String>,
}

/// One entry of `pubKeyCredParams`.
pub struct CredentialParam {
    pub alg: i64,
    pub cred_type: String,
}

/// One entry of an exclude/allow list.
pub struct CredentialDescriptor {
    pub id: Vec<u8>,
    pub cred_type: String,
}

fn rp_value(rp: &RelyingParty) -> Value {
    let mut pairs = vec![(Value::Text("id".to_string()), Value::Text(rp.id.clone()))];
    if let Some(name) = &rp.name {
        pairs.push((Value::Text("name".to_string()), Value::Text(name.clone())));
    }
    Value::Map(pairs)
}

fn user_value(user: &UserEntity) -> Value {
    let mut pairs = vec![(Value::Text("id".to_string()), Value::Bytes(user.id.clone()))];
    if let Some(name) = &user.name {
        pairs.push((Value::Text("name".to_string()), Value::Text(name.clone())));
    }
    if let Some(display_name) = &user.display_name {
        pairs.push((
            Value::Text("displayName".to_string()),
            Value::Text(display_name.clone()),
        ));
    }
    Value::Map(pairs)
}

fn cred_params_value(params: &[CredentialParam]) -> Value {
    Value::Array(
        params
            .iter()
            .map(|p| {
                Value::Map(vec![
                    (Value::Text("alg".to_string()), int(p.alg)),
                    (Value::Text("type".to_string()), Value::Text(p.cred_type.clone())),
                ])
            })
            .collect(),
    )
}

fn cred_descriptor_list_value(list: &[CredentialDescriptor]) -> Value {
    Value::Array(
        list.iter()
            .map(|d| {
                Value::Map(vec![
                    (Value::Text("id".to_string()), Value::Bytes(d.id.clone())),
                    (Value::Text("type".to_string()), Value::Text(d.cred_type.clone())),
                ])
            })
            .collect(),
    )
}

/// Optional, pre-encrypted/pre-computed inputs shared by MakeCredential
/// and GetAssertion that depend on the PIN/UV protocol in effect.
#[derive(Default)]
pub struct PinAuthParams {
    pub pin_auth: Option<Vec<u8>>,
    pub pin_protocol: Option<u8>,
}

/// authenticatorMakeCredential (0x01).
#[allow(clippy::too_many_arguments)]
pub fn make_credential(
    transport: &dyn Transport,
    device_name: &str,
    client_data_hash: &[u8],
    rp: &RelyingParty,
    user: &UserEntity,
    pub_key_cred_params: &[CredentialParam],
    exclude_list: &[CredentialDescriptor],
    extensions: Option<Value>,
    options: Option<Value>,
    pin_auth_params: PinAuthParams,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    let mut pairs = vec![
        (1, bytes(client_data_hash)),
        (2, rp_value(rp)),
        (3, user_value(user)),
        (4, cred_params_value(pub_key_cred_params)),
    ];
    if !exclude_list.is_empty() {
        pairs.push((5, cred_descriptor_list_value(exclude_list)));
    }
    if let Some(extensions) = extensions {
        pairs.push((6, extensions));
    }
    if let Some(options) = options {
        pairs.push((7, options));
    }
    if let Some(pin_auth) = pin_auth_params.pin_auth {
        pairs.push((8, bytes(&pin_auth)));
    }
    if let Some(pin_protocol) = pin_auth_params.pin_protocol {
        pairs.push((9, int(pin_protocol as i64)));
    }

    command::execute(
        transport,
        device_name,
        CtapCommand::MakeCredential,
        Some(map(pairs)),
        cancel,
    )
}

/// authenticatorGetAssertion (0x02).
#[allow(clippy::too_many_arguments)]
pub fn get_assertion(
    transport: &dyn Transport,
    device_name: &str,
    rp_id: &str,
    client_data_hash: &[u8],
    allow_list: &[CredentialDescriptor],
    extensions: Option<Value>,
    options: Option<Value>,
    pin_auth_params: PinAuthParams,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    let mut pairs = vec![
        (1, Value::Text(rp_id.to_string())),
        (2, bytes(client_data_hash)),
    ];
    if !allow_list.is_empty() {
        pairs.push((3, cred_descriptor_list_value(allow_list)));
    }
    if let Some(extensions) = extensions {
        pairs.push((4, extensions));
    }
    if let Some(options) = options {
        pairs.push((5, options));
    }
    if let Some(pin_auth) = pin_auth_params.pin_auth {
        pairs.push((6, bytes(&pin_auth)));
    }
    if let Some(pin_protocol) = pin_auth_params.pin_protocol {
        pairs.push((7, int(pin_protocol as i64)));
    }

    command::execute(
        transport,
        device_name,
        CtapCommand::GetAssertion,
        Some(map(pairs)),
        cancel,
    )
}

const CRED_MGMT_GET_CREDS_METADATA: i64 = 0x01;
const CRED_MGMT_ENUMERATE_RPS_BEGIN: i64 = 0x02;
const CRED_MGMT_ENUMERATE_RPS_GET_NEXT: i64 = 0x03;
const CRED_MGMT_ENUMERATE_CREDENTIALS_BEGIN: i64 = 0x04;
const CRED_MGMT_ENUMERATE_CREDENTIALS_GET_NEXT: i64 = 0x05;
const CRED_MGMT_DELETE_CREDENTIAL: i64 = 0x06;

fn credential_management(
    transport: &dyn Transport,
    device_name: &str,
    sub_command: i64,
    sub_command_params: Option<Value>,
    pin_protocol: Option<u8>,
    pin_auth: Option<&[u8]>,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    let mut pairs = vec![(1, int(sub_command))];
    if let Some(params) = sub_command_params {
        pairs.push((2, params));
    }
    if let Some(pin_protocol) = pin_protocol {
        pairs.push((3, int(pin_protocol as i64)));
    }
    if let Some(pin_auth) = pin_auth {
        pairs.push((4, bytes(pin_auth)));
    }
    command::execute(
        transport,
        device_name,
        CtapCommand::CredentialManagement,
        Some(map(pairs)),
        cancel,
    )
}

/// CredentialManagement subCommand 0x01: getCredsMetadata.
pub fn get_creds_metadata(
    transport: &dyn Transport,
    device_name: &str,
    pin_protocol: u8,
    pin_auth: &[u8],
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    credential_management(
        transport,
        device_name,
        CRED_MGMT_GET_CREDS_METADATA,
        None,
        Some(pin_protocol),
        Some(pin_auth),
        cancel,
    )
}

/// CredentialManagement subCommand 0x02: enumerateRPsBegin.
pub fn enumerate_rps_begin(
    transport: &dyn Transport,
    device_name: &str,
    pin_protocol: u8,
    pin_auth: &[u8],
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    credential_management(
        transport,
        device_name,
        CRED_MGMT_ENUMERATE_RPS_BEGIN,
        None,
        Some(pin_protocol),
        Some(pin_auth),
        cancel,
    )
}

/// CredentialManagement subCommand 0x03: enumerateRPsGetNextRP.
pub fn enumerate_rps_get_next(
    transport: &dyn Transport,
    device_name: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    credential_management(
        transport,
        device_name,
        CRED_MGMT_ENUMERATE_RPS_GET_NEXT,
        None,
        None,
        None,
        cancel,
    )
}

/// CredentialManagement subCommand 0x04: enumerateCredentialsBegin.
/// `rp_id_hash` is SHA-256(rpId), computed by the caller.
pub fn enumerate_credentials_begin(
    transport: &dyn Transport,
    device_name: &str,
    rp_id_hash: &[u8],
    pin_protocol: u8,
    pin_auth: &[u8],
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    let sub_params = Value::Map(vec![(
        int(1),
        bytes(rp_id_hash),
    )]);
    credential_management(
        transport,
        device_name,
        CRED_MGMT_ENUMERATE_CREDENTIALS_BEGIN,
        Some(sub_params),
        Some(pin_protocol),
        Some(pin_auth),
        cancel,
    )
}

/// CredentialManagement subCommand 0x05: enumerateCredentialsGetNextCredential.
pub fn enumerate_credentials_get_next(
    transport: &dyn Transport,
    device_name: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    credential_management(
        transport,
        device_name,
        CRED_MGMT_ENUMERATE_CREDENTIALS_GET_NEXT,
        None,
        None,
        None,
        cancel,
    )
}

/// CredentialManagement subCommand 0x06: deleteCredential.
pub fn delete_credential(
    transport: &dyn Transport,
    device_name: &str,
    credential_id: &CredentialDescriptor,
    pin_protocol: u8,
    pin_auth: &[u8],
    cancel: &CancellationToken,
) -> Result<Vec<u8>, Error> {
    let descriptor = Value::Map(vec![
        (Value::Text("id".to_string()), Value::Bytes(credential_id.id.clone())),
        (
            Value::Text("type".to_string()),
            Value::Text(credential_id.cred_type.clone()),
        ),
    ]);
    let params = Value::Map(vec![(int(2), descriptor)]);
    credential_management(
        transport,
        device_name,
        CRED_MGMT_DELETE_CREDENTIAL,
        Some(params),
        Some(pin_protocol),
        Some(pin_auth),
        cancel,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use std::cell::RefCell;

    struct FakeTransport {
        response: Vec<u8>,
        sent: RefCell<Vec<u8>>,
    }

    impl Transport for FakeTransport {
        fn send(&self, message: &[u8], _cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
            *self.sent.borrow_mut() = message.to_vec();
            Ok(self.response.clone())
        }
        fn dispose(self: Box<Self>) {}
    }

    #[test]
    fn get_info_sends_bare_command_byte() {
        let transport = FakeTransport { response: vec![0x00], sent: RefCell::new(vec![]) };
        let cancel = CancellationToken::new();
        get_info(&transport, "dev", &cancel).unwrap();
        assert_eq!(*transport.sent.borrow(), vec![0x04]);
    }

    #[test]
    fn get_pin_token_uses_spec_key_numbering() {
        let transport = FakeTransport { response: vec![0x00, 0xA0], sent: RefCell::new(vec![]) };
        let cancel = CancellationToken::new();
        let key_agreement = Value::Map(vec![(int(1), int(2))]);
        get_pin_token(&transport, "dev", 1, key_agreement, &[0xAA; 16], &cancel).unwrap();

        let sent = transport.sent.borrow();
        assert_eq!(sent[0], 0x06); // ClientPin command byte
        let decoded: Value = ciborium::from_reader(&sent[1..]).unwrap();
        let pairs = decoded.into_map().unwrap();
        let has_key = |k: i64| pairs.iter().any(|(key, _)| key == &int(k));
        assert!(has_key(1)); // pinProtocol
        assert!(has_key(2)); // subCommand
        assert!(has_key(3)); // keyAgreement
        assert!(has_key(6)); // pinHashEnc, NOT 4 as the teacher's code used
        assert!(!has_key(4));
    }

    #[test]
    fn make_credential_builds_rp_and_user_maps() {
        let transport = FakeTransport { response: vec![0x00], sent: RefCell::new(vec![]) };
        let cancel = CancellationToken::new();
        let rp = RelyingParty { id: "example.com".to_string(), name: None };
        let user = UserEntity { id: vec![1, 2, 3], name: Some("alice".to_string()), display_name: None };
        let params = vec![CredentialParam { alg: -7, cred_type: "public-key".to_string() }];
        make_credential(
            &transport,
            "dev",
            &[0u8; 32],
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
        assert_eq!(transport.sent.borrow()[0], 0x01);
    }

    #[test]
    fn get_assertion_omits_empty_allow_list() {
        let transport = FakeTransport { response: vec![0x00], sent: RefCell::new(vec![]) };
        let cancel = CancellationToken::new();
        get_assertion(
            &transport,
            "dev",
            "example.com",
            &[0u8; 32],
            &[],
            None,
            None,
            PinAuthParams::default(),
            &cancel,
        )
        .unwrap();
        let sent = transport.sent.borrow();
        let decoded: Value = ciborium::from_reader(&sent[1..]).unwrap();
        let pairs = decoded.into_map().unwrap();
        assert!(!pairs.iter().any(|(k, _)| k == &int(3)));
    }

    #[test]
    fn get_assertion_carries_extensions_at_key_four() {
        let transport = FakeTransport { response: vec![0x00], sent: RefCell::new(vec![]) };
        let cancel = CancellationToken::new();
        let extensions = Value::Map(vec![(Value::Text("hmac-secret".to_string()), Value::Bool(true))]);
        get_assertion(
            &transport,
            "dev",
            "example.com",
            &[0u8; 32],
            &[],
            Some(extensions),
            None,
            PinAuthParams::default(),
            &cancel,
        )
        .unwrap();
        let sent = transport.sent.borrow();
        let decoded: Value = ciborium::from_reader(&sent[1..]).unwrap();
        let pairs = decoded.into_map().unwrap();
        assert!(pairs.iter().any(|(k, _)| k == &int(4)));
    }
}
