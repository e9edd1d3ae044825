//! Bluetooth HID keyboard and mouse daemon
//!
//! Registers a HID profile with bluetoothd and forwards the local keyboards
//! and mice to every connected host as HIDP input reports.

use std::{env, sync::Arc};

use log::{info, warn};
use tokio::signal;
use zbus::{connection, zvariant::ObjectPath};

mod bluetooth;
mod config;
mod error;
mod hid;

use crate::{
   bluetooth::{
      adapter,
      l2cap::L2capSocket,
      profile::{self, HID_UUID, HidProfile, ProfileManager1Proxy, SessionRegistry},
   },
   config::Config,
   error::Result,
};

#[tokio::main]
async fn main() -> Result<()> {
   init_logging();

   info!("Starting hidpd...");

   let config = Config::load()?;
   info!(
      "Loaded configuration (control PSM {:#06x}, interrupt PSM {:#06x})",
      config.control_psm, config.interrupt_psm
   );

   if let Err(e) = adapter::prepare(&config).await {
      warn!("Adapter preparation failed: {e}");
   }

   let listener = Arc::new(L2capSocket::listen(
      config.interrupt_psm,
      config.listen_backlog,
      false,
   )?);
   info!("Listening for interrupt channels on {}", listener.addr());

   let sessions = SessionRegistry::default();
   let profile = HidProfile::new(
      listener.clone(),
      config.discovery(),
      config.session_options(),
      sessions.clone(),
   );
   let profile_path = ObjectPath::try_from(config.profile_path.as_str())?;

   let connection = connection::Builder::system()?
      .serve_at(config.profile_path.as_str(), profile)?
      .build()
      .await?;

   let manager = ProfileManager1Proxy::new(&connection).await?;
   manager
      .register_profile(
         &profile_path,
         &HID_UUID.to_string(),
         profile::registration_options(&config)?,
      )
      .await?;
   info!("HID profile registered at {profile_path}");

   signal::ctrl_c().await?;
   info!("Shutting down hidpd...");

   if let Err(e) = manager.unregister_profile(&profile_path).await {
      warn!("Failed to unregister profile: {e}");
   }
   tokio::task::spawn_blocking(move || sessions.close_all()).await?;
   if let Err(e) = listener.close() {
      warn!("Failed to close interrupt listener: {e}");
   }

   Ok(())
}

/// `RUST_LOG` wins; otherwise `DEBUG=1` raises the default level.
fn init_logging() {
   let default_level = if env::var("DEBUG").is_ok_and(|v| v == "1") {
      "debug"
   } else {
      "info"
   };
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
      .init();
}
