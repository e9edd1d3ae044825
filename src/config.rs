//! Configuration management for the HID daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including channel PSMs, input device discovery rules and the
//! parameters passed to bluetoothd when registering the profile.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   error::{HidError, Result},
   hid::{discovery::DeviceDiscovery, session::SessionOptions},
};

/// Built-in SDP record describing the keyboard + mouse combo device.
const DEFAULT_SERVICE_RECORD: &str = include_str!("../sdp_record.xml");

/// Main configuration structure for the daemon.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   #[serde(default = "default_control_psm")]
   pub control_psm: u16,

   #[serde(default = "default_interrupt_psm")]
   pub interrupt_psm: u16,

   #[serde(default = "default_listen_backlog")]
   pub listen_backlog: usize,

   #[serde(default = "default_profile_path")]
   pub profile_path: String,

   #[serde(default = "default_input_dir")]
   pub input_dir: PathBuf,

   #[serde(default = "default_keyboard_suffix")]
   pub keyboard_suffix: String,

   #[serde(default = "default_mouse_suffix")]
   pub mouse_suffix: String,

   #[serde(default = "default_hello_delay_ms")]
   pub hello_delay_ms: u64,

   /// SDP record handed to bluetoothd; the built-in record is used if unset.
   #[serde(default)]
   pub service_record: Option<PathBuf>,

   /// Adapter name such as `hci0`; the default adapter is used if unset.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default)]
   pub alias: Option<String>,

   #[serde(default = "default_true")]
   pub discoverable: bool,

   #[serde(default = "default_true")]
   pub require_authentication: bool,

   #[serde(default = "default_true")]
   pub require_authorization: bool,
}

const fn default_control_psm() -> u16 {
   0x11
}

const fn default_interrupt_psm() -> u16 {
   0x13
}

const fn default_listen_backlog() -> usize {
   1
}

fn default_profile_path() -> String {
   "/org/hidpd/profile".to_string()
}

fn default_input_dir() -> PathBuf {
   PathBuf::from("/dev/input/by-path")
}

fn default_keyboard_suffix() -> String {
   "event-kbd".to_string()
}

fn default_mouse_suffix() -> String {
   "event-mouse".to_string()
}

const fn default_hello_delay_ms() -> u64 {
   1000
}

const fn default_true() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         control_psm: default_control_psm(),
         interrupt_psm: default_interrupt_psm(),
         listen_backlog: default_listen_backlog(),
         profile_path: default_profile_path(),
         input_dir: default_input_dir(),
         keyboard_suffix: default_keyboard_suffix(),
         mouse_suffix: default_mouse_suffix(),
         hello_delay_ms: default_hello_delay_ms(),
         service_record: None,
         adapter: None,
         alias: None,
         discoverable: true,
         require_authentication: true,
         require_authorization: true,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("HIDPD_HOME") {
         PathBuf::from(home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(HidError::ConfigDirNotFound);
      };

      Ok(config_dir.join("hidpd").join("config.toml"))
   }

   /// Returns the SDP record XML to register with bluetoothd.
   pub fn service_record(&self) -> Result<String> {
      match &self.service_record {
         Some(path) => Ok(fs::read_to_string(path)?),
         None => Ok(DEFAULT_SERVICE_RECORD.to_string()),
      }
   }

   pub fn discovery(&self) -> DeviceDiscovery {
      DeviceDiscovery::new(
         self.input_dir.clone(),
         self.keyboard_suffix.as_str(),
         self.mouse_suffix.as_str(),
      )
   }

   pub const fn session_options(&self) -> SessionOptions {
      SessionOptions {
         hello_delay: Duration::from_millis(self.hello_delay_ms),
      }
   }
}
