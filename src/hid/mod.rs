//! HID device emulation.
//!
//! Turns local keyboard and mouse events into HIDP input reports and
//! drives the control channel of each connected host.

pub mod device;
pub mod discovery;
pub mod keymap;
pub mod protocol;
pub mod report;
pub mod session;
