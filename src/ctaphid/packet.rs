//! CTAPHID packet layout (CTAP 2.0 §8.1.4): fragmentation of a logical
//! message into 64-byte HID reports, and reassembly back into a message.
//! Pure framing, no device I/O — [`super::channel`] owns the HID device.

use crate::error::TransportError;

pub const HID_REPORT_SIZE: usize = 64;
pub const INIT_HEADER_SIZE: usize = 7;
pub const CONT_HEADER_SIZE: usize = 5;
pub const INIT_PAYLOAD_SIZE: usize = HID_REPORT_SIZE - INIT_HEADER_SIZE;
pub const CONT_PAYLOAD_SIZE: usize = HID_REPORT_SIZE - CONT_HEADER_SIZE;

pub const BROADCAST_CID: u32 = 0xFFFF_FFFF;

pub const CMD_PING: u8 = 0x01;
pub const CMD_MSG: u8 = 0x03;
pub const CMD_LOCK: u8 = 0x04;
pub const CMD_INIT: u8 = 0x06;
pub const CMD_WINK: u8 = 0x08;
pub const CMD_CBOR: u8 = 0x10;
pub const CMD_CANCEL: u8 = 0x11;
pub const CMD_KEEPALIVE: u8 = 0x3B;
pub const CMD_ERROR: u8 = 0x3F;

const TYPE_INIT_BIT: u8 = 0x80;

/// Split a logical CTAPHID message into a sequence of 64-byte packets: one
/// init packet followed by as many continuation packets as needed.
pub fn fragment(cid: u32, cmd: u8, payload: &[u8]) -> Vec<[u8; HID_REPORT_SIZE]> {
    let mut packets = Vec::new();
    let cid_bytes = cid.to_be_bytes();

    let (first, rest) = payload.split_at(payload.len().min(INIT_PAYLOAD_SIZE));
    let mut init = [0u8; HID_REPORT_SIZE];
    init[0..4].copy_from_slice(&cid_bytes);
    init[4] = TYPE_INIT_BIT | cmd;
    init[5..7].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    init[7..7 + first.len()].copy_from_slice(first);
    packets.push(init);

    for (seq, chunk) in (0u8..).zip(rest.chunks(CONT_PAYLOAD_SIZE)) {
        let mut cont = [0u8; HID_REPORT_SIZE];
        cont[0..4].copy_from_slice(&cid_bytes);
        cont[4] = seq;
        cont[5..5 + chunk.len()].copy_from_slice(chunk);
        packets.push(cont);
    }

    packets
}

#[derive(Debug)]
pub struct InitPacket {
    pub cid: u32,
    pub cmd: u8,
    pub bcnt: usize,
    pub data: Vec<u8>,
}

pub fn parse_init(packet: &[u8]) -> Result<InitPacket, TransportError> {
    if packet.len() < INIT_HEADER_SIZE {
        return Err(TransportError::Framing(format!(
            "CTAPHID init packet too short: {} bytes",
            packet.len()
        )));
    }
    let cid = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
    if packet[4] & TYPE_INIT_BIT == 0 {
        return Err(TransportError::Framing(
            "expected CTAPHID init packet, got continuation packet".to_string(),
        ));
    }
    let cmd = packet[4] & !TYPE_INIT_BIT;
    let bcnt = u16::from_be_bytes([packet[5], packet[6]]) as usize;
    let data = packet[7..].to_vec();
    Ok(InitPacket { cid, cmd, bcnt, data })
}

pub struct ContPacket {
    pub cid: u32,
    pub seq: u8,
    pub data: Vec<u8>,
}

pub fn parse_cont(packet: &[u8]) -> Result<ContPacket, TransportError> {
    if packet.len() < CONT_HEADER_SIZE {
        return Err(TransportError::Framing(format!(
            "CTAPHID continuation packet too short: {} bytes",
            packet.len()
        )));
    }
    let cid = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
    if packet[4] & TYPE_INIT_BIT != 0 {
        return Err(TransportError::Framing(
            "expected CTAPHID continuation packet, got init packet".to_string(),
        ));
    }
    Ok(ContPacket {
        cid,
        seq: packet[4],
        data: packet[5..].to_vec(),
    })
}

/// Accumulates an in-progress CTAPHID message across continuation packets.
pub struct Reassembler {
    cid: u32,
    cmd: u8,
    total: usize,
    buffer: Vec<u8>,
    next_seq: u8,
}

impl Reassembler {
    /// Start reassembly from an already-parsed init packet.
    pub fn start(init: InitPacket) -> Self {
        let take = init.data.len().min(init.bcnt);
        Self {
            cid: init.cid,
            cmd: init.cmd,
            total: init.bcnt,
            buffer: init.data[..take].to_vec(),
            next_seq: 0,
        }
    }

    pub fn cmd(&self) -> u8 {
        self.cmd
    }

    pub fn is_complete(&self) -> bool {
        self.buffer.len() >= self.total
    }

    /// Feed a continuation packet. Errors if the sequence number or
    /// channel identifier does not match what was expected.
    pub fn feed_cont(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let cont = parse_cont(packet)?;
        if cont.cid != self.cid {
            return Err(TransportError::Framing(format!(
                "CTAPHID continuation packet CID mismatch: expected {:08X}, got {:08X}",
                self.cid, cont.cid
            )));
        }
        if cont.seq != self.next_seq {
            return Err(TransportError::Framing(format!(
                "CTAPHID continuation packet out of sequence: expected {}, got {}",
                self.next_seq, cont.seq
            )));
        }
        let remaining = self.total - self.buffer.len();
        let take = cont.data.len().min(remaining);
        self.buffer.extend_from_slice(&cont.data[..take]);
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_short_payload_into_a_single_init_packet() {
        let packets = fragment(0x11223344, CMD_PING, &[1, 2, 3]);
        assert_eq!(packets.len(), 1);
        let init = parse_init(&packets[0]).unwrap();
        assert_eq!(init.cid, 0x11223344);
        assert_eq!(init.cmd, CMD_PING);
        assert_eq!(init.bcnt, 3);
        assert_eq!(&init.data[..3], &[1, 2, 3]);
    }

    #[test]
    fn fragments_long_payload_into_init_plus_continuations() {
        let payload = vec![0xAAu8; INIT_PAYLOAD_SIZE + CONT_PAYLOAD_SIZE + 1];
        let packets = fragment(BROADCAST_CID, CMD_CBOR, &payload);
        assert_eq!(packets.len(), 3);

        let init = parse_init(&packets[0]).unwrap();
        assert_eq!(init.bcnt, payload.len());

        let cont0 = parse_cont(&packets[1]).unwrap();
        assert_eq!(cont0.seq, 0);
        let cont1 = parse_cont(&packets[2]).unwrap();
        assert_eq!(cont1.seq, 1);
    }

    #[test]
    fn reassembles_a_fragmented_message() {
        let payload: Vec<u8> = (0..200u16).map(|b| b as u8).collect();
        let packets = fragment(0xAABBCCDD, CMD_CBOR, &payload);

        let init = parse_init(&packets[0]).unwrap();
        let mut reassembler = Reassembler::start(init);
        for packet in &packets[1..] {
            reassembler.feed_cont(packet).unwrap();
        }
        assert!(reassembler.is_complete());
        assert_eq!(reassembler.finish(), payload);
    }

    #[test]
    fn rejects_out_of_sequence_continuation() {
        let payload = vec![0xAAu8; INIT_PAYLOAD_SIZE + CONT_PAYLOAD_SIZE * 2];
        let packets = fragment(1, CMD_CBOR, &payload);
        let init = parse_init(&packets[0]).unwrap();
        let mut reassembler = Reassembler::start(init);
        let err = reassembler.feed_cont(&packets[2]).unwrap_err();
        assert!(matches!(err, TransportError::Framing(_)));
    }

    #[test]
    fn parse_init_rejects_continuation_shaped_packet() {
        let payload = vec![0u8; INIT_PAYLOAD_SIZE + 1];
        let packets = fragment(1, CMD_CBOR, &payload);
        assert!(parse_init(&packets[1]).is_err());
    }
}
