//! CTAPHID channel: device discovery, the INIT handshake, and the
//! write/read exchange used by [`crate::transport::HidTransport`].
//!
//! Grounded on the teacher's `transport::send_hid`/`receive_hid` and
//! `device::enumerate_hid_devices`, generalized from a Feitian-only VID
//! filter to the FIDO usage page/usage pair every compliant authenticator
//! advertises (CTAP 2.0 §8.1.8.1), and widened with fragmentation,
//! keep-alive filtering, cancellation, and the reopen-on-fault recovery
//! that the original single-report ping/pong did not need.

use std::cell::RefCell;
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::cancel::CancellationToken;
use crate::error::{Error, TransportError};

use super::packet::{
    self, ContPacket, InitPacket, Reassembler, BROADCAST_CID, CMD_CBOR, CMD_ERROR, CMD_INIT,
    CMD_KEEPALIVE, CMD_MSG, HID_REPORT_SIZE,
};

const FIDO_USAGE_PAGE: u16 = 0xF1D0;
const FIDO_USAGE: u16 = 0x0001;
const INIT_NONCE_SIZE: usize = 8;
const READ_TIMEOUT: Duration = Duration::from_millis(3000);
const OPEN_RETRY_PAUSE: Duration = Duration::from_millis(200);

/// A discovered CTAPHID-capable USB-HID interface, not yet opened.
#[derive(Debug, Clone)]
pub struct HidDeviceInfo {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_name: Option<String>,
}

/// Enumerate USB-HID interfaces advertising the FIDO usage page/usage,
/// admitting only candidates that a probe-open can actually reach.
pub fn discover() -> Result<Vec<HidDeviceInfo>, TransportError> {
    let api = hidapi::HidApi::new()?;
    let mut devices = Vec::new();

    for info in api.device_list() {
        if info.usage_page() != FIDO_USAGE_PAGE || info.usage() != FIDO_USAGE {
            continue;
        }

        let path = info.path().to_string_lossy().to_string();
        match open_hid_stream(&path) {
            Ok(probe) => drop(probe), // closes the probed stream immediately
            Err(e) => {
                log::warn!("CTAPHID candidate {path} failed probe-open, skipping: {e}");
                continue;
            }
        }

        log::debug!(
            "found CTAPHID interface at {path} (VID={:04x} PID={:04x})",
            info.vendor_id(),
            info.product_id()
        );

        devices.push(HidDeviceInfo {
            path,
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            product_name: info.product_string().map(str::to_string),
        });
    }

    Ok(devices)
}

fn open_hid_stream(path: &str) -> Result<hidapi::HidDevice, TransportError> {
    let api = hidapi::HidApi::new()?;
    let c_path = std::ffi::CString::new(path)
        .map_err(|_| TransportError::OpenFailedDeviceNotConnected(path.to_string()))?;
    Ok(api.open_path(&c_path)?)
}

fn is_path_enumerable(path: &str) -> bool {
    hidapi::HidApi::new()
        .map(|api| {
            api.device_list()
                .any(|info| info.path().to_string_lossy() == path)
        })
        .unwrap_or(false)
}

/// An open CTAPHID channel, allocated to a non-broadcast CID by [`open`].
pub struct Channel {
    device: RefCell<hidapi::HidDevice>,
    path: String,
    cid: u32,
}

/// Open the HID interface at `path` and perform the CTAPHID INIT
/// handshake to allocate a channel identifier.
///
/// On a first open failure, pause briefly and retry once before giving up
/// (spec §4.1 "Open"); the final error distinguishes a device that is
/// still enumerable (likely transient/busy) from one that has vanished.
pub fn open(path: &str) -> Result<Channel, TransportError> {
    let device = match open_hid_stream(path) {
        Ok(device) => device,
        Err(_) => {
            log::warn!("CTAPHID open failed for {path}, pausing and retrying once");
            std::thread::sleep(OPEN_RETRY_PAUSE);
            open_hid_stream(path).map_err(|_| {
                if is_path_enumerable(path) {
                    TransportError::OpenFailedDevicePresent(path.to_string())
                } else {
                    TransportError::OpenFailedDeviceNotConnected(path.to_string())
                }
            })?
        }
    };

    let mut channel = Channel {
        device: RefCell::new(device),
        path: path.to_string(),
        cid: BROADCAST_CID,
    };
    channel.cid = channel.init_handshake()?;
    Ok(channel)
}

/// §4.1 INIT nonce/CID extraction, factored out so it can be exercised
/// without a real HID device.
fn verify_init_response(nonce: &[u8; INIT_NONCE_SIZE], response: &[u8]) -> Result<u32, TransportError> {
    if response.len() < INIT_NONCE_SIZE + 4 || response[..INIT_NONCE_SIZE] != nonce[..] {
        return Err(TransportError::InitFailed(
            "INIT response nonce mismatch".to_string(),
        ));
    }
    Ok(u32::from_be_bytes([
        response[INIT_NONCE_SIZE],
        response[INIT_NONCE_SIZE + 1],
        response[INIT_NONCE_SIZE + 2],
        response[INIT_NONCE_SIZE + 3],
    ]))
}

/// §4.1 keep-alive/error/foreign-cid filtering for one init frame read
/// while waiting for `cid`'s response. `Ok(None)` means keep reading;
/// `Ok(Some(_))` is the frame reassembly should start from.
fn accept_init_frame(cid: u32, init: InitPacket) -> Result<Option<InitPacket>, TransportError> {
    if init.cid != cid {
        return Ok(None);
    }
    if init.cmd == CMD_KEEPALIVE {
        log::trace!("discarding CTAPHID keep-alive frame on cid {cid:08x}");
        return Ok(None);
    }
    if init.cmd == CMD_ERROR {
        let code = init.data.first().copied().unwrap_or(0xFF);
        return Err(TransportError::Framing(format!(
            "CTAPHID error frame: code 0x{code:02X}"
        )));
    }
    Ok(Some(init))
}

impl Channel {
    fn reopen(&self) -> Result<(), TransportError> {
        log::warn!("reopening CTAPHID stream at {} after I/O fault", self.path);
        let device = open_hid_stream(&self.path)?;
        *self.device.borrow_mut() = device;
        Ok(())
    }

    fn write_report_once(&self, packet: &[u8; HID_REPORT_SIZE]) -> Result<(), TransportError> {
        // hidapi expects the report-ID byte prepended; this device class
        // always uses report ID 0.
        let mut buf = [0u8; HID_REPORT_SIZE + 1];
        buf[1..].copy_from_slice(packet);
        self.device.borrow().write(&buf)?;
        Ok(())
    }

    /// One transparent reopen-and-retry on a write I/O fault (spec §7).
    fn write_report(&self, packet: &[u8; HID_REPORT_SIZE]) -> Result<(), TransportError> {
        match self.write_report_once(packet) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.reopen()?;
                self.write_report_once(packet)
            }
        }
    }

    fn read_report_once(&self) -> Result<[u8; HID_REPORT_SIZE], TransportError> {
        let mut buf = [0u8; HID_REPORT_SIZE];
        let n = self
            .device
            .borrow()
            .read_timeout(&mut buf, READ_TIMEOUT.as_millis() as i32)?;
        if n == 0 {
            return Err(TransportError::Framing(
                "CTAPHID read timed out".to_string(),
            ));
        }
        Ok(buf)
    }

    /// One transparent reopen-and-retry of a single read frame after a
    /// stream fault (spec §7).
    fn read_report(&self) -> Result<[u8; HID_REPORT_SIZE], TransportError> {
        match self.read_report_once() {
            Ok(buf) => Ok(buf),
            Err(_) => {
                self.reopen()?;
                self.read_report_once()
            }
        }
    }

    fn init_handshake(&mut self) -> Result<u32, TransportError> {
        let mut nonce = [0u8; INIT_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        self.send_on_cid(BROADCAST_CID, CMD_INIT, &nonce, &CancellationToken::new())?;
        let response = self.recv_on_cid(BROADCAST_CID, CMD_INIT, &CancellationToken::new())?;
        verify_init_response(&nonce, &response)
    }

    fn send_on_cid(
        &self,
        cid: u32,
        cmd: u8,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        for packet in packet::fragment(cid, cmd, payload) {
            if cancel.is_cancelled() {
                return Err(TransportError::Other("cancelled".to_string()));
            }
            self.write_report(&packet)?;
        }
        Ok(())
    }

    /// Read a full message addressed to `cid`, discarding keep-alive
    /// frames for other transactions and failing on a device-reported
    /// error frame.
    fn recv_on_cid(
        &self,
        cid: u32,
        _expected_cmd: u8,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + READ_TIMEOUT * 10;
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Other("cancelled".to_string()));
            }
            if Instant::now() > deadline {
                return Err(TransportError::Framing(
                    "CTAPHID response deadline exceeded".to_string(),
                ));
            }

            let raw = self.read_report()?;
            let init = packet::parse_init(&raw)?;
            let init = match accept_init_frame(cid, init)? {
                Some(init) => init,
                None => continue,
            };

            let mut reassembler = Reassembler::start(init);
            while !reassembler.is_complete() {
                if cancel.is_cancelled() {
                    return Err(TransportError::Other("cancelled".to_string()));
                }
                let raw = self.read_report()?;
                let cont: Result<ContPacket, _> = packet::parse_cont(&raw);
                match cont {
                    Ok(_) => reassembler.feed_cont(&raw)?,
                    Err(_) => {
                        // An init packet arrived mid-reassembly: only a
                        // keep-alive for the same CID is tolerated.
                        let inner = packet::parse_init(&raw)?;
                        if inner.cid == cid && inner.cmd == CMD_KEEPALIVE {
                            continue;
                        }
                        return Err(TransportError::Framing(
                            "unexpected init packet during CTAPHID reassembly".to_string(),
                        ));
                    }
                }
            }
            return Ok(reassembler.finish());
        }
    }

    /// Send a CTAPHID MSG (U2F/CTAP1) payload and return the response.
    pub fn send_msg(&self, payload: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
        self.exchange(CMD_MSG, payload, cancel)
    }

    /// Send a CTAPHID CBOR (CTAP2) payload and return the response.
    pub fn send_cbor(&self, payload: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
        self.exchange(CMD_CBOR, payload, cancel)
    }

    fn exchange(&self, cmd: u8, payload: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.send_on_cid(self.cid, cmd, payload, cancel)
            .map_err(Error::Transport)?;
        self.recv_on_cid(self.cid, cmd, cancel).map_err(|e| {
            if cancel.is_cancelled() {
                Error::Cancelled
            } else {
                Error::Transport(e)
            }
        })
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_init_response_extracts_cid_on_nonce_match() {
        let nonce = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut response = nonce.to_vec();
        response.extend_from_slice(&[0x12, 0x34, 0x56, 0x78]);
        let cid = verify_init_response(&nonce, &response).unwrap();
        assert_eq!(cid, 0x1234_5678);
    }

    #[test]
    fn verify_init_response_rejects_nonce_mismatch() {
        let nonce = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut response = vec![0xFFu8; INIT_NONCE_SIZE];
        response.extend_from_slice(&[0, 0, 0, 0]);
        assert!(verify_init_response(&nonce, &response).is_err());
    }

    #[test]
    fn verify_init_response_rejects_short_response() {
        let nonce = [1u8, 2, 3, 4, 5, 6, 7, 8];
        assert!(verify_init_response(&nonce, &nonce).is_err());
    }

    #[test]
    fn accept_init_frame_discards_foreign_cid() {
        let init = InitPacket { cid: 2, cmd: CMD_CBOR, bcnt: 0, data: vec![] };
        assert!(accept_init_frame(1, init).unwrap().is_none());
    }

    #[test]
    fn accept_init_frame_discards_keepalive() {
        let init = InitPacket { cid: 1, cmd: CMD_KEEPALIVE, bcnt: 0, data: vec![] };
        assert!(accept_init_frame(1, init).unwrap().is_none());
    }

    #[test]
    fn accept_init_frame_surfaces_error_frame() {
        let init = InitPacket { cid: 1, cmd: CMD_ERROR, bcnt: 1, data: vec![0x01] };
        let err = accept_init_frame(1, init).unwrap_err();
        assert!(matches!(err, TransportError::Framing(_)));
    }

    #[test]
    fn accept_init_frame_passes_through_matching_data_frame() {
        let init = InitPacket { cid: 1, cmd: CMD_CBOR, bcnt: 1, data: vec![0xAA] };
        let accepted = accept_init_frame(1, init).unwrap().unwrap();
        assert_eq!(accepted.cmd, CMD_CBOR);
        assert_eq!(accepted.data, vec![0xAA]);
    }
}
