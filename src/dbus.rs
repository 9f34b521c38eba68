use log::{debug, info};
use zbus::{fdo, interface, object_server::SignalEmitter};

use crate::{
   bluetooth::{bluez::BluezRadio, manager::ConnectionManager},
   error::LinkError,
   session::DeviceIdentity,
};

pub struct LinkService {
   manager: ConnectionManager<BluezRadio>,
}

impl LinkService {
   pub const fn new(manager: ConnectionManager<BluezRadio>) -> Self {
      Self { manager }
   }
}

fn to_fdo(e: LinkError) -> fdo::Error {
   match e {
      LinkError::PermissionDenied => fdo::Error::AccessDenied(e.to_string()),
      LinkError::CapabilityUnavailable => fdo::Error::NotSupported(e.to_string()),
      _ => fdo::Error::Failed(e.to_string()),
   }
}

#[interface(name = "org.poslink.Printer")]
impl LinkService {
   async fn scan(&self) -> fdo::Result<String> {
      let device = self.manager.scan().await.map_err(to_fdo)?;
      serde_json::to_string(&device).map_err(|e| fdo::Error::Failed(e.to_string()))
   }

   async fn cancel_scan(&self) {
      self.manager.cancel_scan();
   }

   async fn connect(&self, id: String, name: String) -> fdo::Result<bool> {
      if id.is_empty() {
         return Err(fdo::Error::InvalidArgs("Missing device id".into()));
      }
      self
         .manager
         .connect(DeviceIdentity::new(id, name))
         .await
         .map_err(to_fdo)?;
      Ok(true)
   }

   async fn disconnect(&self) -> fdo::Result<bool> {
      self.manager.disconnect().await.map_err(to_fdo)?;
      Ok(true)
   }

   async fn reconnect_to_last(&self) -> fdo::Result<bool> {
      self.manager.reconnect_to_last().await.map_err(to_fdo)?;
      Ok(true)
   }

   /// Sends raw bytes (hex) over the active link.
   async fn write(&self, data: String) -> fdo::Result<bool> {
      let data = hex::decode(data).map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
      let link = self
         .manager
         .borrow_active_link()
         .await
         .ok_or_else(|| to_fdo(LinkError::NotConnected))?;
      debug!("Writing {} bytes to {}", data.len(), link.label());
      link.write(&data).await.map_err(to_fdo)?;
      Ok(true)
   }

   async fn logout(&self) -> fdo::Result<bool> {
      self.manager.logout().await.map_err(to_fdo)?;
      info!("Session logged out over D-Bus");
      Ok(true)
   }

   // Signals
   #[zbus(signal, name = "StatusChanged")]
   pub async fn link_status_changed(
      emitter: &SignalEmitter<'_>,
      status: &str,
      device_name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn link_lost(emitter: &SignalEmitter<'_>, device_name: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connect_failed(emitter: &SignalEmitter<'_>, reason: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn reconnect_prompt_required(
      emitter: &SignalEmitter<'_>,
      device_name: &str,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn status(&self) -> String {
      self.manager.status().await.to_string()
   }

   #[zbus(property)]
   async fn device_name(&self) -> String {
      self
         .manager
         .connected_device_name()
         .await
         .map(|name| name.to_string())
         .unwrap_or_default()
   }
}
