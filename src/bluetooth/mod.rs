//! Bluetooth transport for the HID daemon.
//!
//! This module provides L2CAP socket handling, adapter preparation and the
//! BlueZ profile through which hosts connect.

pub mod adapter;
pub mod l2cap;
pub mod profile;
pub mod sockaddr;
