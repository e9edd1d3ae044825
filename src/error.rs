//! Error types for the HID daemon.
//!
//! This module defines all error types that can occur while serving a
//! Bluetooth HID session, including socket, D-Bus, input device and
//! configuration errors.

use thiserror::Error;
use tokio::task::JoinError;

/// Main error type for the HID daemon.
#[derive(Error, Debug)]
pub enum HidError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus value error: {0}")]
   DBusValue(#[from] zbus::zvariant::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Socket already closed")]
   SocketClosed,

   #[error("Unexpected socket address family: {0}")]
   AddressFamily(u16),

   #[error("Modifier usage out of range: {0} (must be 0-7)")]
   InvalidModifier(u8),

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Interrupt channel from {actual} does not belong to {expected}")]
   PeerMismatch {
      expected: bluer::Address,
      actual: bluer::Address,
   },

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Worker panicked: {0}")]
   WorkerPanicked(#[from] JoinError),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl From<HidError> for zbus::fdo::Error {
   fn from(e: HidError) -> Self {
      Self::Failed(e.to_string())
   }
}

/// Convenience type alias for Results with `HidError`.
pub type Result<T> = std::result::Result<T, HidError>;
