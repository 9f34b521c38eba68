//! BlueZ implementation of the host radio.
//!
//! The "picker" on a headless host is a filtered discovery pass that takes
//! the first matching peripheral. Links are RFCOMM streams on the
//! configured channel.

use std::{str::FromStr, time::Duration};

use bluer::{
   Adapter, AdapterEvent, Address, DiscoveryFilter, ErrorKind, Session,
   rfcomm::{SocketAddr, Stream},
};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use crate::{
   bluetooth::{
      link::{self, Link},
      radio::Radio,
      recognition::ServiceFilter,
   },
   config::Config,
   error::LinkError,
   session::DeviceIdentity,
};

pub struct BluezRadio {
   session: Option<Session>,
   adapter_name: Option<String>,
   channel: u8,
   scan_timeout: Duration,
}

impl BluezRadio {
   /// Connects to bluetoothd. A missing daemon is not an error here; the
   /// radio simply reports itself unavailable.
   pub async fn new(config: &Config) -> Self {
      let session = match Session::new().await {
         Ok(session) => Some(session),
         Err(e) => {
            warn!("Failed to open BlueZ session: {e}");
            None
         },
      };
      Self {
         session,
         adapter_name: config.adapter.clone(),
         channel: config.rfcomm_channel,
         scan_timeout: config.scan_timeout(),
      }
   }

   async fn adapter(&self) -> Result<Adapter, LinkError> {
      let session = self
         .session
         .as_ref()
         .ok_or(LinkError::CapabilityUnavailable)?;
      let adapter = match &self.adapter_name {
         Some(name) => session.adapter(name),
         None => session.default_adapter().await,
      };
      adapter.map_err(classify)
   }

   /// Runs discovery until `accept` picks a device or `cancel` fires.
   async fn discover<F, Fut>(
      &self,
      adapter: &Adapter,
      filter: &ServiceFilter,
      cancel: &CancellationToken,
      mut accept: F,
   ) -> Result<Address, LinkError>
   where
      F: FnMut(bluer::Device) -> Fut,
      Fut: Future<Output = bool>,
   {
      let discovery_filter = DiscoveryFilter {
         uuids: filter.uuids.iter().copied().collect(),
         ..Default::default()
      };
      if let Err(e) = adapter.set_discovery_filter(discovery_filter).await {
         debug!("Discovery filter rejected: {e}");
      }

      let events = adapter.discover_devices().await.map_err(classify)?;
      tokio::pin!(events);

      let deadline = time::sleep(self.scan_timeout);
      tokio::pin!(deadline);

      loop {
         select! {
            () = cancel.cancelled() => return Err(LinkError::UserCancelled),
            () = &mut deadline => {
               info!("Discovery ended without a match");
               return Err(LinkError::UserCancelled);
            }
            event = events.next() => {
               let Some(event) = event else {
                  return Err(LinkError::UserCancelled);
               };
               let AdapterEvent::DeviceAdded(addr) = event else {
                  continue;
               };
               let Ok(device) = adapter.device(addr) else {
                  continue;
               };
               if accept(device).await {
                  return Ok(addr);
               }
            }
         }
      }
   }

   async fn retained(adapter: &Adapter, addr: Address) -> Result<bool, LinkError> {
      let known = adapter.device_addresses().await.map_err(classify)?;
      if !known.contains(&addr) {
         return Ok(false);
      }
      let device = adapter.device(addr).map_err(classify)?;
      Ok(device.is_paired().await.unwrap_or(false))
   }
}

fn parse_address(device: &DeviceIdentity) -> Result<Address, LinkError> {
   Address::from_str(&device.id)
      .map_err(|_| LinkError::establish_failed(format!("bad address {}", device.id)))
}

fn classify(e: bluer::Error) -> LinkError {
   match e.kind {
      ErrorKind::NotAuthorized | ErrorKind::NotPermitted | ErrorKind::AuthenticationRejected => {
         LinkError::PermissionDenied
      },
      ErrorKind::NotReady | ErrorKind::NotAvailable | ErrorKind::DoesNotExist => {
         LinkError::CapabilityUnavailable
      },
      _ => LinkError::establish_failed(e.to_string()),
   }
}

impl Radio for BluezRadio {
   async fn is_available(&self) -> bool {
      let adapter = match self.adapter().await {
         Ok(adapter) => adapter,
         Err(e) => {
            warn!("No Bluetooth adapter: {e}");
            return false;
         },
      };
      if adapter.is_powered().await.unwrap_or(false) {
         return true;
      }
      match adapter.set_powered(true).await {
         Ok(()) => {
            info!("Powered on adapter {}", adapter.name());
            true
         },
         Err(e) => {
            warn!("Failed to power on adapter {}: {e}", adapter.name());
            false
         },
      }
   }

   async fn pick_device(
      &self,
      filter: &ServiceFilter,
      cancel: CancellationToken,
   ) -> Result<DeviceIdentity, LinkError> {
      let adapter = self.adapter().await?;
      info!("Scanning for printers on {}", adapter.name());

      let addr = self
         .discover(&adapter, filter, &cancel, |device| async move {
            filter.matches_device(&device).await
         })
         .await?;

      let device = adapter.device(addr).map_err(classify)?;
      let name = match device.name().await.ok().flatten() {
         Some(name) => name,
         None => device.alias().await.unwrap_or_else(|_| addr.to_string()),
      };
      Ok(DeviceIdentity::new(addr.to_string(), name))
   }

   async fn establish_link(&self, device: &DeviceIdentity) -> Result<Link, LinkError> {
      let addr = parse_address(device)?;
      let adapter = self.adapter().await?;
      if !Self::retained(&adapter, addr).await? {
         return Err(LinkError::DeviceNotRetained);
      }

      debug!("Opening RFCOMM channel {} to {addr}", self.channel);
      let stream = Stream::connect(SocketAddr::new(addr, self.channel))
         .await
         .map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => LinkError::PermissionDenied,
            _ => LinkError::establish_failed(e.to_string()),
         })?;

      Ok(link::spawn(device.name.clone(), stream))
   }

   async fn discover_and_pair(&self, device: &DeviceIdentity) -> Result<(), LinkError> {
      let addr = parse_address(device)?;
      let adapter = self.adapter().await?;
      info!("Looking for {} ({addr}) to pair", device.name);

      let found = self
         .discover(
            &adapter,
            &ServiceFilter::default(),
            &CancellationToken::new(),
            |candidate| async move { candidate.address() == addr },
         )
         .await;
      if found.is_err() {
         return Err(LinkError::establish_failed("device not found"));
      }

      let peer = adapter.device(addr).map_err(classify)?;
      if !peer.is_paired().await.unwrap_or(false) {
         peer.pair().await.map_err(classify)?;
         info!("Paired with {}", device.name);
      }
      if let Err(e) = peer.set_trusted(true).await {
         warn!("Failed to trust {}: {e}", device.name);
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_parse_address() {
      let printer = DeviceIdentity::new("00:11:22:33:44:55", "TM-m30");
      assert_eq!(
         parse_address(&printer),
         Ok(Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]))
      );

      let bogus = DeviceIdentity::new("not-an-address", "TM-m30");
      assert!(matches!(
         parse_address(&bogus),
         Err(LinkError::LinkEstablishFailed(_))
      ));
   }
}
