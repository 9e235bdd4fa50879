//! USB-HID transport (CTAP 2.0 §8.1): packet framing plus the device
//! channel that drives it.

pub mod channel;
pub mod packet;

pub use channel::{discover, open, Channel, HidDeviceInfo};
