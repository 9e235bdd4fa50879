//! Raw CCID-over-USB engine (CTAP 2.0 §8.3): USB interface class 0x0B
//! discovery and the bulk in/out pipe that carries CCID messages.
//!
//! Grounded on `douglaz-rust-cktap`'s `usb_transport.rs` for the
//! endpoint-discovery and sequence-counter pattern, and on
//! `BjornTheProgrammer-elf2flash`'s `usbh-scsi` storage module for the
//! claim/configure/clear_halt sequence around a `rusb::DeviceHandle`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use rusb::{Context, Direction, TransferType, UsbContext};

use crate::apdu;
use crate::cancel::CancellationToken;
use crate::error::{Error, TransportError};

use super::message::{self, CommandStatus, MessageType, SlotStatus};

const CCID_INTERFACE_CLASS: u8 = 0x0B;
const BULK_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESPONSE_MATCH_ATTEMPTS: usize = 12;
const MAX_TIME_EXTENSION_ATTEMPTS: usize = 30;

/// A USB device exposing a CCID (smart-card) interface, not yet opened.
#[derive(Debug, Clone)]
pub struct CcidDeviceInfo {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

pub fn discover() -> Result<Vec<CcidDeviceInfo>, TransportError> {
    let context = Context::new()?;
    let mut devices = Vec::new();
    for device in context.devices()?.iter() {
        let config = match device.active_config_descriptor() {
            Ok(c) => c,
            Err(_) => continue,
        };
        let is_ccid = config
            .interfaces()
            .flat_map(|i| i.descriptors())
            .any(|d| d.class_code() == CCID_INTERFACE_CLASS);
        if !is_ccid {
            continue;
        }
        let descriptor = device.device_descriptor()?;
        devices.push(CcidDeviceInfo {
            bus_number: device.bus_number(),
            address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
        });
    }
    Ok(devices)
}

struct Endpoints {
    interface: u8,
    in_addr: u8,
    out_addr: u8,
}

fn find_ccid_endpoints(
    config: &rusb::ConfigDescriptor,
) -> Result<Endpoints, TransportError> {
    for interface in config.interfaces() {
        let Some(descriptor) = interface.descriptors().next() else {
            continue;
        };
        if descriptor.class_code() != CCID_INTERFACE_CLASS {
            continue;
        }

        let mut in_addr = None;
        let mut out_addr = None;
        for endpoint in descriptor.endpoint_descriptors() {
            if endpoint.transfer_type() != TransferType::Bulk {
                continue;
            }
            match endpoint.direction() {
                Direction::In => in_addr = Some(endpoint.address()),
                Direction::Out => out_addr = Some(endpoint.address()),
            }
        }

        if let (Some(in_addr), Some(out_addr)) = (in_addr, out_addr) {
            return Ok(Endpoints {
                interface: interface.number(),
                in_addr,
                out_addr,
            });
        }
    }
    Err(TransportError::Ccid(
        "no CCID interface with bulk in/out endpoints".to_string(),
    ))
}

/// §4.3 step 1: decide whether `IccPowerOn` (step 2) must run before
/// `XfrBlock`, from a `GetSlotStatus` response's ICC status bits.
fn decide_power_on(slot_status: SlotStatus) -> Result<bool, TransportError> {
    match slot_status {
        SlotStatus::NoIccPresent => Err(TransportError::NoCardPresent),
        SlotStatus::InactiveIcc => Ok(true),
        SlotStatus::ActiveIcc | SlotStatus::Unknown(_) => Ok(false),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum TimeExtensionStep {
    Done,
    Retry,
    Fail,
}

fn classify_command_status(status: CommandStatus) -> TimeExtensionStep {
    match status {
        CommandStatus::NoError => TimeExtensionStep::Done,
        CommandStatus::TimeExtensionRequested => TimeExtensionStep::Retry,
        CommandStatus::Failed | CommandStatus::Unknown(_) => TimeExtensionStep::Fail,
    }
}

/// An open raw-CCID session. One USB slot (slot 0) is assumed, matching
/// every single-slot FIDO token seen in the pack.
pub struct Session {
    handle: rusb::DeviceHandle<Context>,
    in_addr: u8,
    out_addr: u8,
    seq: AtomicU8,
    slot: u8,
}

pub fn open(bus_number: u8, address: u8) -> Result<Session, TransportError> {
    let context = Context::new()?;
    let device = context
        .devices()?
        .iter()
        .find(|d| d.bus_number() == bus_number && d.address() == address)
        .ok_or_else(|| TransportError::DeviceNotFound(format!("usb {bus_number}:{address}")))?;

    let config = device.active_config_descriptor()?;
    let endpoints = find_ccid_endpoints(&config)?;

    log::debug!("opening CCID device usb {bus_number}:{address}, interface {}", endpoints.interface);
    let mut handle = device.open()?;
    let _ = handle.set_auto_detach_kernel_driver(true);
    handle.claim_interface(endpoints.interface)?;
    handle.clear_halt(endpoints.in_addr)?;
    handle.clear_halt(endpoints.out_addr)?;

    let session = Session {
        handle,
        in_addr: endpoints.in_addr,
        out_addr: endpoints.out_addr,
        seq: AtomicU8::new(0),
        slot: 0,
    };
    session.power_on()?;
    Ok(session)
}

impl Session {
    fn next_seq(&self) -> u8 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn write_message(&self, message: &[u8]) -> Result<(), TransportError> {
        self.handle
            .write_bulk(self.out_addr, message, BULK_TIMEOUT)?;
        Ok(())
    }

    fn read_message(&self) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; 4096];
        let n = self.handle.read_bulk(self.in_addr, &mut buf, BULK_TIMEOUT)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Read up to [`MAX_RESPONSE_MATCH_ATTEMPTS`] messages, discarding any
    /// whose (type, bSeq) does not match what this exchange expects.
    fn await_response(
        &self,
        seq: u8,
        expected_type: MessageType,
    ) -> Result<message::Response, TransportError> {
        for _ in 0..MAX_RESPONSE_MATCH_ATTEMPTS {
            let raw = self.read_message()?;
            let response = message::parse_response(&raw)?;
            if response.seq == seq && response.message_type == expected_type {
                return Ok(response);
            }
        }
        Err(TransportError::CcidResponseMatchExhausted)
    }

    /// Apply the time-extension loop on top of [`Self::await_response`]:
    /// cmdStatus=2 means "read the next matching response", up to
    /// [`MAX_TIME_EXTENSION_ATTEMPTS`] times.
    fn await_final_response(
        &self,
        seq: u8,
        expected_type: MessageType,
    ) -> Result<message::Response, TransportError> {
        for attempt in 0..MAX_TIME_EXTENSION_ATTEMPTS {
            let response = self.await_response(seq, expected_type)?;
            match classify_command_status(response.command_status) {
                TimeExtensionStep::Done => return Ok(response),
                TimeExtensionStep::Retry => {
                    log::trace!("CCID time extension requested (attempt {attempt})");
                    continue;
                }
                TimeExtensionStep::Fail => return Err(TransportError::CcidCommandFailed),
            }
        }
        Err(TransportError::CcidTimeExtensionExceeded)
    }

    /// Write one CCID command under a fresh bSeq and wait for its final
    /// (post time-extension) matching response.
    fn exchange(
        &self,
        message: &[u8],
        seq: u8,
        expected_type: MessageType,
    ) -> Result<message::Response, TransportError> {
        self.write_message(message)?;
        self.await_final_response(seq, expected_type)
    }

    fn power_on(&self) -> Result<(), TransportError> {
        let seq = self.next_seq();
        let response = self.exchange(
            &message::icc_power_on(self.slot, seq),
            seq,
            MessageType::RdrToPcDataBlock,
        )?;
        if response.slot_status == SlotStatus::NoIccPresent {
            return Err(TransportError::NoCardPresent);
        }
        Ok(())
    }

    /// §4.3 `SendApdu` pipeline: `GetSlotStatus`, a conditional
    /// `IccPowerOn`, then `XfrBlock`, each under its own fresh bSeq.
    fn transmit_apdu(&self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        let status_seq = self.next_seq();
        let status_response = self.exchange(
            &message::get_slot_status(self.slot, status_seq),
            status_seq,
            MessageType::RdrToPcSlotStatus,
        )?;

        if decide_power_on(status_response.slot_status)? {
            let power_seq = self.next_seq();
            self.exchange(
                &message::icc_power_on(self.slot, power_seq),
                power_seq,
                MessageType::RdrToPcDataBlock,
            )?;
        }

        let xfr_seq = self.next_seq();
        let response = self.exchange(
            &message::xfr_block(self.slot, xfr_seq, apdu),
            xfr_seq,
            MessageType::RdrToPcDataBlock,
        )?;
        Ok(response.data)
    }

    pub fn send(&self, message: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // The CCID XfrBlock data payload is the ICC's raw response
        // (DATA || SW1 || SW2) verbatim, so transmit_apdu's return value
        // already has the shape apdu::split_response expects.
        let select = apdu::build_select_fido_apdu();
        let select_response = self.transmit_apdu(&select).map_err(Error::Transport)?;
        let (_, sw1, sw2) = apdu::split_response(&select_response).map_err(Error::Transport)?;
        if (sw1, sw2) != (0x90, 0x00) {
            return Err(Error::Transport(TransportError::AppletSelectFailed { sw1, sw2 }));
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        apdu::send_ctap_message(message, |single_apdu| self.transmit_apdu(single_apdu))
            .map_err(Error::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decide_power_on_skips_when_icc_already_active() {
        assert_eq!(decide_power_on(SlotStatus::ActiveIcc).unwrap(), false);
    }

    #[test]
    fn decide_power_on_required_when_icc_present_but_off() {
        assert_eq!(decide_power_on(SlotStatus::InactiveIcc).unwrap(), true);
    }

    #[test]
    fn decide_power_on_fails_when_no_card_present() {
        assert!(matches!(
            decide_power_on(SlotStatus::NoIccPresent),
            Err(TransportError::NoCardPresent)
        ));
    }

    #[test]
    fn classify_command_status_success_is_done() {
        assert_eq!(classify_command_status(CommandStatus::NoError), TimeExtensionStep::Done);
    }

    #[test]
    fn classify_command_status_time_extension_is_retry() {
        assert_eq!(
            classify_command_status(CommandStatus::TimeExtensionRequested),
            TimeExtensionStep::Retry
        );
    }

    #[test]
    fn classify_command_status_failed_is_fail() {
        assert_eq!(classify_command_status(CommandStatus::Failed), TimeExtensionStep::Fail);
    }
}
