//! POS printer link D-Bus service
//!
//! This service keeps a single Bluetooth link to the paired receipt
//! printer, restores it after restarts and drops, and exposes the link
//! state to the POS front-end over the session bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{
   bluez::BluezRadio,
   manager::{ConnectionManager, ManagerOptions},
};
use dbus::LinkService;
use event::{EventBus, LinkEvent};
use store::{HeedStore, MemoryStore, Persistence};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod session;
mod store;

use crate::{dbus::LinkServiceSignals, error::Result};

const OBJECT_PATH: &str = "/org/poslink/printer";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting poslinkd D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration: adapter {}, RFCOMM channel {}, fallback {:?}",
      config.adapter.as_deref().unwrap_or("default"),
      config.rfcomm_channel,
      config.reconnect_fallback
   );

   let persistence = match HeedStore::open_default() {
      Ok(store) => Persistence::new(store),
      Err(e) => {
         warn!("Link store unavailable, state will not survive a restart: {e}");
         Persistence::new(MemoryStore::default())
      },
   };

   let radio = Arc::new(BluezRadio::new(&config).await);
   let manager = ConnectionManager::new(radio, persistence, ManagerOptions::from_config(&config));

   // Forward manager events to D-Bus
   let event_bus = EventProcessor::new();
   {
      let event_bus = event_bus.clone();
      manager.subscribe(move |event| event_bus.emit(event.clone()));
   }

   let service = LinkService::new(manager.clone());

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.poslink")?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("poslinkd D-Bus service started at org.poslink");

   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down poslinkd...");
   manager.shutdown().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<LinkEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<LinkEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<LinkService>, event: LinkEvent) -> Result<()> {
      match event {
         LinkEvent::StatusChanged {
            status,
            device_name,
         } => {
            let status: &'static str = status.into();
            iface
               .link_status_changed(status, device_name.as_deref().unwrap_or_default())
               .await?;
            let service = iface.get().await;
            service.status_changed(iface.signal_emitter()).await?;
            service.device_name_changed(iface.signal_emitter()).await?;
         },
         LinkEvent::LinkLost { device_name } => {
            iface.link_lost(&device_name).await?;
         },
         LinkEvent::ConnectFailed { error } => {
            if !error.is_internal() {
               iface.connect_failed(&error.to_string()).await?;
            }
         },
         LinkEvent::ReconnectPromptRequired { device_name } => {
            iface.reconnect_prompt_required(&device_name).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, LinkService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: LinkEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
