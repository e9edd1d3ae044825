//! Local input device enumeration.

use std::{
   fs, io,
   path::{Path, PathBuf},
};

use log::{debug, warn};
use smol_str::SmolStr;

use crate::error::Result;

/// Keyboard and mouse device paths found in one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSet {
   pub keyboards: Vec<PathBuf>,
   pub mice: Vec<PathBuf>,
}

impl DeviceSet {
   pub fn is_empty(&self) -> bool {
      self.keyboards.is_empty() && self.mice.is_empty()
   }
}

/// Matches device nodes by file-name suffix, the way udev names them under
/// `/dev/input/by-path` (`...-event-kbd`, `...-event-mouse`).
#[derive(Debug, Clone)]
pub struct DeviceDiscovery {
   dir: PathBuf,
   keyboard_suffix: SmolStr,
   mouse_suffix: SmolStr,
}

impl DeviceDiscovery {
   pub fn new(dir: PathBuf, keyboard_suffix: &str, mouse_suffix: &str) -> Self {
      Self {
         dir,
         keyboard_suffix: keyboard_suffix.into(),
         mouse_suffix: mouse_suffix.into(),
      }
   }

   /// Scans the directory. A missing directory yields an empty set.
   pub fn scan(&self) -> Result<DeviceSet> {
      let entries = match fs::read_dir(&self.dir) {
         Ok(entries) => entries,
         Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("Input directory {} does not exist", self.dir.display());
            return Ok(DeviceSet::default());
         },
         Err(e) => return Err(e.into()),
      };

      let mut set = DeviceSet::default();
      for entry in entries {
         let path = entry?.path();
         let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
         };
         if name.ends_with(self.keyboard_suffix.as_str()) {
            debug!("Found keyboard {name}");
            set.keyboards.push(path);
         } else if name.ends_with(self.mouse_suffix.as_str()) {
            debug!("Found mouse {name}");
            set.mice.push(path);
         }
      }
      set.keyboards.sort();
      set.mice.sort();
      Ok(set)
   }

   pub fn dir(&self) -> &Path {
      &self.dir
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_scan_splits_by_suffix() {
      let dir = tempfile::tempdir().unwrap();
      for name in [
         "platform-i8042-serio-0-event-kbd",
         "pci-0000:00:14.0-usb-0:2:1.0-event-mouse",
         "pci-0000:00:14.0-usb-0:2:1.0-mouse",
         "pci-0000:00:14.0-usb-0:1:1.0-event-kbd",
      ] {
         fs::write(dir.path().join(name), b"").unwrap();
      }

      let discovery = DeviceDiscovery::new(dir.path().to_path_buf(), "event-kbd", "event-mouse");
      let set = discovery.scan().unwrap();

      assert_eq!(set.keyboards, vec![
         dir.path().join("pci-0000:00:14.0-usb-0:1:1.0-event-kbd"),
         dir.path().join("platform-i8042-serio-0-event-kbd"),
      ]);
      assert_eq!(set.mice, vec![
         dir.path().join("pci-0000:00:14.0-usb-0:2:1.0-event-mouse")
      ]);
   }

   #[test]
   fn test_missing_directory_is_empty() {
      let dir = tempfile::tempdir().unwrap();
      let discovery = DeviceDiscovery::new(dir.path().join("absent"), "event-kbd", "event-mouse");
      assert!(discovery.scan().unwrap().is_empty());
   }
}
