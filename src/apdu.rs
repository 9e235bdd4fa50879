//! Short-form ISO 7816 APDU construction/parsing, and the CTAP-over-APDU
//! command-chaining + response-drainage state machine shared by the PC/SC
//! engine (§4.2) and the raw CCID engine (§4.3) — they differ only in how
//! a single APDU gets transmitted on the wire, not in the chaining logic
//! itself.

use crate::error::TransportError;

/// FIDO applet AID: `A0 00 00 06 47 2F 00 01`.
pub const FIDO_AID: [u8; 8] = [0xA0, 0x00, 0x00, 0x06, 0x47, 0x2F, 0x00, 0x01];

/// Maximum `Lc` for a short-form APDU built by this crate, reserving room
/// for the 4-byte header, an `Le` byte, and reader-added bytes.
pub const MAX_SHORT_LC: usize = 251;

const CLA_CHAIN_MORE: u8 = 0x90;
const CLA_CHAIN_LAST: u8 = 0x80;
const INS_CTAP_MSG: u8 = 0x10;
const INS_GET_NEXT_RESPONSE: u8 = 0x11;
const INS_SELECT: u8 = 0xA4;
const INS_ISO_GET_RESPONSE: u8 = 0xC0;

const SW_SUCCESS: (u8, u8) = (0x90, 0x00);
const SW1_BYTES_AVAILABLE: u8 = 0x61;
const SW_GET_NEXT: (u8, u8) = (0x91, 0x00);

/// Build a short-form APDU: `CLA INS P1 P2 [Lc DATA] [Le]`.
///
/// `data.len()` must not exceed [`MAX_SHORT_LC`].
pub fn build_apdu(cla: u8, ins: u8, p1: u8, p2: u8, data: &[u8], le: Option<u8>) -> Vec<u8> {
    assert!(data.len() <= MAX_SHORT_LC, "APDU data exceeds short-form Lc");

    let mut apdu = Vec::with_capacity(5 + data.len());
    apdu.push(cla);
    apdu.push(ins);
    apdu.push(p1);
    apdu.push(p2);

    if !data.is_empty() {
        apdu.push(data.len() as u8);
        apdu.extend_from_slice(data);
    }

    if let Some(le) = le {
        apdu.push(le);
    }

    apdu
}

/// Build the APDU that selects the FIDO applet.
pub fn build_select_fido_apdu() -> Vec<u8> {
    build_apdu(0x00, INS_SELECT, 0x04, 0x00, &FIDO_AID, Some(0x00))
}

/// Split a raw APDU response into `(data, sw1, sw2)`.
pub fn split_response(response: &[u8]) -> Result<(&[u8], u8, u8), TransportError> {
    if response.len() < 2 {
        return Err(TransportError::Framing(format!(
            "APDU response too short: {} bytes (need at least 2 for SW)",
            response.len()
        )));
    }
    let (data, sw) = response.split_at(response.len() - 2);
    Ok((data, sw[0], sw[1]))
}

/// Drive CTAP command chaining (CLA bit 0x10 = "more blocks follow") and
/// response drainage (SW=0x9100 CTAP GET NEXT RESPONSE, SW1=0x61 ISO GET
/// RESPONSE) over an arbitrary single-APDU transport.
///
/// `transmit` sends one complete APDU and returns the complete raw
/// response (`DATA || SW1 || SW2`); it is supplied by the caller so the
/// same chaining logic drives both the PC/SC and CCID engines.
pub fn send_ctap_message<F>(message: &[u8], mut transmit: F) -> Result<Vec<u8>, TransportError>
where
    F: FnMut(&[u8]) -> Result<Vec<u8>, TransportError>,
{
    let blocks: Vec<&[u8]> = message.chunks(MAX_SHORT_LC).collect();
    let blocks: Vec<&[u8]> = if blocks.is_empty() { vec![&[][..]] } else { blocks };
    let last_index = blocks.len() - 1;

    let mut final_response = None;
    for (index, block) in blocks.into_iter().enumerate() {
        let cla = if index == last_index {
            CLA_CHAIN_LAST
        } else {
            CLA_CHAIN_MORE
        };
        let apdu = build_apdu(cla, INS_CTAP_MSG, 0x00, 0x00, block, Some(0x00));
        let response = transmit(&apdu)?;
        let (data, sw1, sw2) = split_response(&response)?;

        if index != last_index {
            if (sw1, sw2) != SW_SUCCESS || !data.is_empty() {
                return Err(TransportError::Apdu { sw1, sw2 });
            }
        } else {
            final_response = Some((data.to_vec(), sw1, sw2));
        }
    }

    let (mut accumulated, mut sw1, mut sw2) = final_response
        .ok_or_else(|| TransportError::Framing("no APDU blocks were sent".to_string()))?;

    loop {
        if (sw1, sw2) == SW_SUCCESS {
            return Ok(accumulated);
        }
        if (sw1, sw2) == SW_GET_NEXT {
            let apdu = build_apdu(CLA_CHAIN_LAST, INS_GET_NEXT_RESPONSE, 0x00, 0x00, &[], Some(0x00));
            let response = transmit(&apdu)?;
            let (data, next_sw1, next_sw2) = split_response(&response)?;
            accumulated.extend_from_slice(data);
            sw1 = next_sw1;
            sw2 = next_sw2;
            continue;
        }
        if sw1 == SW1_BYTES_AVAILABLE {
            let le = sw2; // 0 denotes 256, which is what build_apdu already encodes as 0x00
            let apdu = build_apdu(0x00, INS_ISO_GET_RESPONSE, 0x00, 0x00, &[], Some(le));
            let response = transmit(&apdu)?;
            let (data, next_sw1, next_sw2) = split_response(&response)?;
            accumulated.extend_from_slice(data);
            sw1 = next_sw1;
            sw2 = next_sw2;
            continue;
        }
        return Err(TransportError::Apdu { sw1, sw2 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_short_apdu_with_data_and_le() {
        let apdu = build_apdu(0x00, 0xA4, 0x04, 0x00, &[0x01, 0x02], Some(0x00));
        assert_eq!(apdu, vec![0x00, 0xA4, 0x04, 0x00, 0x02, 0x01, 0x02, 0x00]);
    }

    #[test]
    fn builds_apdu_without_data() {
        let apdu = build_apdu(0x00, 0xA4, 0x04, 0x00, &[], Some(0x00));
        assert_eq!(apdu, vec![0x00, 0xA4, 0x04, 0x00, 0x00]);
    }

    #[test]
    fn select_fido_apdu_carries_the_aid() {
        let apdu = build_select_fido_apdu();
        assert_eq!(&apdu[5..13], &FIDO_AID);
        assert_eq!(apdu[1], 0xA4);
    }

    #[test]
    fn split_response_separates_data_and_sw() {
        let (data, sw1, sw2) = split_response(&[1, 2, 3, 0x90, 0x00]).unwrap();
        assert_eq!(data, &[1, 2, 3]);
        assert_eq!((sw1, sw2), (0x90, 0x00));
    }

    #[test]
    fn split_response_rejects_too_short() {
        assert!(split_response(&[0x90]).is_err());
    }

    #[test]
    fn single_block_at_exactly_251_bytes() {
        let message = vec![0xAAu8; 251];
        let mut calls = 0;
        let result = send_ctap_message(&message, |apdu| {
            calls += 1;
            assert_eq!(apdu[0], CLA_CHAIN_LAST);
            assert_eq!(apdu.len(), 4 + 1 + 251 + 1);
            Ok(vec![0x90, 0x00])
        })
        .unwrap();
        assert_eq!(calls, 1);
        assert!(result.is_empty());
    }

    #[test]
    fn two_blocks_at_252_bytes() {
        let message = vec![0xBBu8; 252];
        let seen_classes = std::cell::RefCell::new(Vec::new());
        let result = send_ctap_message(&message, |apdu| {
            seen_classes.borrow_mut().push(apdu[0]);
            Ok(vec![0x90, 0x00])
        })
        .unwrap();
        assert_eq!(*seen_classes.borrow(), vec![CLA_CHAIN_MORE, CLA_CHAIN_LAST]);
        assert!(result.is_empty());
    }

    #[test]
    fn intermediate_block_chaining_error_propagates() {
        let message = vec![0xCCu8; 252];
        let mut call = 0;
        let err = send_ctap_message(&message, |_apdu| {
            call += 1;
            if call == 1 {
                Ok(vec![0x6A, 0x80])
            } else {
                Ok(vec![0x90, 0x00])
            }
        })
        .unwrap_err();
        assert!(matches!(err, TransportError::Apdu { sw1: 0x6A, sw2: 0x80 }));
    }

    #[test]
    fn ctap_get_next_response_drainage() {
        let message = vec![0x01];
        let mut call = 0;
        let result = send_ctap_message(&message, |_apdu| {
            call += 1;
            match call {
                1 => Ok([&b"first"[..], &[0x91, 0x00]].concat()),
                2 => Ok([&b"second"[..], &[0x90, 0x00]].concat()),
                _ => panic!("unexpected extra call"),
            }
        })
        .unwrap();
        assert_eq!(result, b"firstsecond");
    }

    #[test]
    fn iso_get_response_drainage() {
        let message = vec![0x01];
        let mut call = 0;
        let result = send_ctap_message(&message, |apdu| {
            call += 1;
            match call {
                1 => Ok([&b"data1"[..], &[0x61, 0x20]].concat()),
                2 => {
                    assert_eq!(apdu[1], INS_ISO_GET_RESPONSE);
                    assert_eq!(apdu[4], 0x20);
                    Ok([&b"data2"[..], &[0x90, 0x00]].concat())
                }
                _ => panic!("unexpected extra call"),
            }
        })
        .unwrap();
        assert_eq!(result, b"data1data2");
    }

    #[test]
    fn unrecognized_status_word_terminates_with_apdu_error() {
        let message = vec![0x01];
        let err = send_ctap_message(&message, |_apdu| Ok(vec![0x6D, 0x00])).unwrap_err();
        assert!(matches!(err, TransportError::Apdu { sw1: 0x6D, sw2: 0x00 }));
    }
}
