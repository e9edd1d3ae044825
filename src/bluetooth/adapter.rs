//! Adapter preparation through bluetoothd.

use bluer::Session;
use log::info;

use crate::{config::Config, error::Result};

/// Powers on the configured adapter and makes it visible to hosts.
pub async fn prepare(config: &Config) -> Result<()> {
   let session = Session::new().await?;
   let adapter = match &config.adapter {
      Some(name) => session.adapter(name)?,
      None => session.default_adapter().await?,
   };
   let name = adapter.name().to_owned();

   if !adapter.is_powered().await? {
      adapter.set_powered(true).await?;
      info!("Powered on adapter: {name}");
   }

   if let Some(alias) = &config.alias {
      adapter.set_alias(alias.clone()).await?;
      info!("Adapter {name} alias set to {alias}");
   }

   if config.discoverable {
      adapter.set_pairable(true).await?;
      adapter.set_discoverable_timeout(0).await?;
      adapter.set_discoverable(true).await?;
   }

   info!(
      "Adapter {name} ready at {} (discoverable: {})",
      adapter.address().await?,
      config.discoverable
   );
   Ok(())
}
