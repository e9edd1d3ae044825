//! BlueZ profile through which hosts connect.
//!
//! bluetoothd owns the control PSM and hands each incoming control channel
//! to [`HidProfile::new_connection`]; the interrupt channel arrives on our
//! own listener. Both are joined into a [`HidSession`] kept in the
//! [`SessionRegistry`] until the host disconnects.

use std::{collections::HashMap, os::fd::OwnedFd, sync::Arc};

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;
use zbus::{
   interface, proxy,
   zvariant::{self, ObjectPath, OwnedObjectPath, OwnedValue, Value},
};

use crate::{
   bluetooth::l2cap::L2capSocket,
   config::Config,
   error::{HidError, Result},
   hid::{
      discovery::DeviceDiscovery,
      session::{HidSession, SessionOptions},
   },
};

/// Human Interface Device service class
pub const HID_UUID: Uuid = uuid::uuid!("00001124-0000-1000-8000-00805f9b34fb");

#[proxy(
   interface = "org.bluez.ProfileManager1",
   default_service = "org.bluez",
   default_path = "/org/bluez"
)]
pub trait ProfileManager1 {
   fn register_profile(
      &self,
      profile: &ObjectPath<'_>,
      uuid: &str,
      options: HashMap<&str, Value<'_>>,
   ) -> zbus::Result<()>;

   fn unregister_profile(&self, profile: &ObjectPath<'_>) -> zbus::Result<()>;
}

/// Options passed to `RegisterProfile`.
pub fn registration_options(config: &Config) -> Result<HashMap<&'static str, Value<'static>>> {
   Ok(HashMap::from([
      ("PSM", Value::from(config.control_psm)),
      (
         "RequireAuthentication",
         Value::from(config.require_authentication),
      ),
      (
         "RequireAuthorization",
         Value::from(config.require_authorization),
      ),
      ("ServiceRecord", Value::from(config.service_record()?)),
   ]))
}

#[derive(Default)]
struct Entries {
   live: HashMap<String, HidSession>,
   /// Devices whose session is still being built, and whether a disconnect
   /// was requested meanwhile.
   connecting: HashMap<String, bool>,
}

/// Sessions of connected hosts, keyed by device object path.
#[derive(Clone, Default)]
pub struct SessionRegistry {
   entries: Arc<Mutex<Entries>>,
}

impl SessionRegistry {
   /// Marks a device as connecting. A disconnect request arriving before
   /// [`insert`](Self::insert) cancels the session being built.
   pub fn begin(&self, device: &str) {
      self.entries.lock().connecting.insert(device.to_owned(), false);
   }

   /// Forgets a connection attempt that failed.
   pub fn abandon(&self, device: &str) {
      self.entries.lock().connecting.remove(device);
   }

   /// Stores a session, closing any previous one of the same device as
   /// well as sessions whose host already went away. Returns false if the
   /// device was disconnected while connecting; the session is closed.
   pub fn insert(&self, device: &str, session: HidSession) -> bool {
      let mut entries = self.entries.lock();
      if entries.connecting.remove(device) == Some(true) {
         drop(entries);
         info!("{device} disconnected while connecting, dropping its session");
         session.close();
         return false;
      }

      let previous = entries.live.insert(device.to_owned(), session);
      let finished: Vec<_> = entries
         .live
         .extract_if(|_, session| !session.is_active())
         .collect();
      drop(entries);

      if let Some(previous) = previous {
         info!("Replacing existing session of {device}");
         previous.close();
      }
      for (device, session) in finished {
         debug!("Reaping finished session of {device}");
         session.close();
      }
      true
   }

   /// Removes and closes the session of a device, or cancels the one being
   /// built. Returns whether there was anything to stop.
   pub fn remove(&self, device: &str) -> bool {
      let (session, cancelled) = {
         let mut entries = self.entries.lock();
         let cancelled = match entries.connecting.get_mut(device) {
            Some(cancelled) => {
               *cancelled = true;
               true
            },
            None => false,
         };
         (entries.live.remove(device), cancelled)
      };

      if cancelled {
         info!("Cancelled pending connection of {device}");
      }
      match session {
         Some(session) => {
            session.close();
            true
         },
         None => cancelled,
      }
   }

   pub fn close_all(&self) {
      let sessions: Vec<_> = {
         let mut entries = self.entries.lock();
         entries.connecting.values_mut().for_each(|cancelled| *cancelled = true);
         entries.live.drain().collect()
      };
      for (device, session) in sessions {
         info!("Closing session of {device}");
         session.close();
      }
   }

   pub fn len(&self) -> usize {
      self.entries.lock().live.len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

pub struct HidProfile {
   listener: Arc<L2capSocket>,
   discovery: DeviceDiscovery,
   options: SessionOptions,
   sessions: SessionRegistry,
}

impl HidProfile {
   pub const fn new(
      listener: Arc<L2capSocket>,
      discovery: DeviceDiscovery,
      options: SessionOptions,
      sessions: SessionRegistry,
   ) -> Self {
      Self {
         listener,
         discovery,
         options,
         sessions,
      }
   }
}

#[interface(name = "org.bluez.Profile1")]
impl HidProfile {
   fn release(&self) {
      info!("Profile released by bluetoothd");
   }

   async fn new_connection(
      &self,
      device: OwnedObjectPath,
      fd: zvariant::OwnedFd,
      properties: HashMap<String, OwnedValue>,
   ) -> zbus::fdo::Result<()> {
      let name = device.as_str().to_owned();
      info!("New connection from {name}");
      debug!("Connection properties: {properties:?}");

      let control = OwnedFd::from(fd);
      let listener = self.listener.clone();
      let discovery = self.discovery.clone();
      let options = self.options;
      let sessions = self.sessions.clone();
      sessions.begin(&name);

      tokio::task::spawn_blocking(move || {
         let session = establish(device.as_str(), &listener, control, &discovery, &options)
            .inspect_err(|_| sessions.abandon(device.as_str()))?;
         sessions.insert(device.as_str(), session);
         Ok::<_, HidError>(())
      })
      .await
      .map_err(HidError::from)?
      .inspect_err(|e| warn!("Connection from {name} failed: {e}"))?;

      Ok(())
   }

   async fn request_disconnection(&self, device: OwnedObjectPath) -> zbus::fdo::Result<()> {
      info!("Disconnection requested for {}", device.as_str());
      let sessions = self.sessions.clone();
      let closed = tokio::task::spawn_blocking(move || sessions.remove(device.as_str()))
         .await
         .map_err(HidError::from)?;
      if !closed {
         debug!("No session to close");
      }
      Ok(())
   }
}

/// Accepts the interrupt channel, adopts the control channel and starts a
/// session over every input device currently present.
fn establish(
   device: &str,
   listener: &L2capSocket,
   control: OwnedFd,
   discovery: &DeviceDiscovery,
   options: &SessionOptions,
) -> Result<HidSession> {
   let interrupt = listener
      .accept()
      .inspect_err(|e| warn!("Accept failed on {}: {e}", listener.addr()))?;
   info!("Interrupt channel accepted from {}", interrupt.addr());
   verify_peer(device, interrupt.addr().addr)?;

   let control = L2capSocket::wrap(control)?;
   debug!("Control channel adopted: {control:?}");

   let devices = discovery.scan()?;
   if devices.is_empty() {
      warn!("No input devices under {}", discovery.dir().display());
   }
   let session = HidSession::start(interrupt, control, &devices, options)?;
   info!("Serving {} input device(s)", session.adapter_count());
   Ok(session)
}

/// Address encoded in a BlueZ device path (`.../dev_00_11_22_33_44_55`).
fn device_address(device: &str) -> Option<Address> {
   let name = device.rsplit('/').next()?.strip_prefix("dev_")?;
   name.replace('_', ":").parse().ok()
}

/// Rejects an interrupt channel opened by another host than the one the
/// control channel belongs to.
fn verify_peer(device: &str, peer: Address) -> Result<()> {
   match device_address(device) {
      Some(expected) if expected != peer => {
         warn!("Interrupt channel from {peer} does not match {device}");
         Err(HidError::PeerMismatch {
            expected,
            actual: peer,
         })
      },
      Some(_) => Ok(()),
      None => {
         debug!("No device address in {device}, accepting {peer}");
         Ok(())
      },
   }
}
