//! CCID bulk message framing (USB CCID spec rev 1.1, §6): the 10-byte
//! header shared by every message, plus the handful of message types the
//! raw-CCID engine needs.
//!
//! Grounded on `douglaz-rust-cktap`'s `ccid.rs`, generalized from its
//! fixed single-slot tunnel-card assumptions to the slot index a real
//! reader descriptor assigns.

use crate::error::TransportError;

const HEADER_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    PcToRdrIccPowerOn,
    PcToRdrIccPowerOff,
    PcToRdrGetSlotStatus,
    PcToRdrXfrBlock,
    RdrToPcDataBlock,
    RdrToPcSlotStatus,
    Other(u8),
}

impl MessageType {
    fn to_byte(self) -> u8 {
        match self {
            Self::PcToRdrIccPowerOn => 0x62,
            Self::PcToRdrIccPowerOff => 0x63,
            Self::PcToRdrGetSlotStatus => 0x65,
            Self::PcToRdrXfrBlock => 0x6F,
            Self::RdrToPcDataBlock => 0x80,
            Self::RdrToPcSlotStatus => 0x81,
            Self::Other(b) => b,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            0x62 => Self::PcToRdrIccPowerOn,
            0x63 => Self::PcToRdrIccPowerOff,
            0x65 => Self::PcToRdrGetSlotStatus,
            0x6F => Self::PcToRdrXfrBlock,
            0x80 => Self::RdrToPcDataBlock,
            0x81 => Self::RdrToPcSlotStatus,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    ActiveIcc,
    InactiveIcc,
    NoIccPresent,
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    NoError,
    Failed,
    TimeExtensionRequested,
    Unknown(u8),
}

/// Build a `PC_to_RDR_IccPowerOn` message.
pub fn icc_power_on(slot: u8, seq: u8) -> Vec<u8> {
    build_header(MessageType::PcToRdrIccPowerOn, 0, slot, seq, [0, 0, 0])
}

/// Build a `PC_to_RDR_GetSlotStatus` message.
pub fn get_slot_status(slot: u8, seq: u8) -> Vec<u8> {
    build_header(MessageType::PcToRdrGetSlotStatus, 0, slot, seq, [0, 0, 0])
}

/// Build a `PC_to_RDR_XfrBlock` message carrying `data` (a complete APDU).
/// msgSpecific is {bBWI=0x0A, wLevelParameter=0x0000}.
pub fn xfr_block(slot: u8, seq: u8, data: &[u8]) -> Vec<u8> {
    let mut message = build_header(
        MessageType::PcToRdrXfrBlock,
        data.len() as u32,
        slot,
        seq,
        [0x0A, 0x00, 0x00],
    );
    message.extend_from_slice(data);
    message
}

fn build_header(
    message_type: MessageType,
    length: u32,
    slot: u8,
    seq: u8,
    specific: [u8; 3],
) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.push(message_type.to_byte());
    header.extend_from_slice(&length.to_le_bytes());
    header.push(slot);
    header.push(seq);
    header.extend_from_slice(&specific);
    header
}

/// A parsed CCID response header plus whatever payload followed it.
pub struct Response {
    pub message_type: MessageType,
    pub slot: u8,
    pub seq: u8,
    pub slot_status: SlotStatus,
    pub command_status: CommandStatus,
    pub data: Vec<u8>,
}

pub fn parse_response(raw: &[u8]) -> Result<Response, TransportError> {
    if raw.len() < HEADER_LEN {
        return Err(TransportError::Ccid(format!(
            "response shorter than CCID header: {} bytes",
            raw.len()
        )));
    }
    let message_type = MessageType::from_byte(raw[0]);
    let length = u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]) as usize;
    let slot = raw[5];
    let seq = raw[6];
    let b_status = raw[7];

    let slot_status = match b_status & 0x03 {
        0 => SlotStatus::ActiveIcc,
        1 => SlotStatus::InactiveIcc,
        2 => SlotStatus::NoIccPresent,
        other => SlotStatus::Unknown(other),
    };
    let command_status = match (b_status >> 6) & 0x03 {
        0 => CommandStatus::NoError,
        1 => CommandStatus::Failed,
        2 => CommandStatus::TimeExtensionRequested,
        other => CommandStatus::Unknown(other),
    };

    let available = raw.len().saturating_sub(HEADER_LEN);
    let take = length.min(available);
    let data = raw[HEADER_LEN..HEADER_LEN + take].to_vec();

    Ok(Response {
        message_type,
        slot,
        seq,
        slot_status,
        command_status,
        data,
    })
}
