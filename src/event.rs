//! Event handling for link status updates.
//!
//! The connection manager reports every user-visible change through an
//! `EventBus`. `StatusHub` fans those events out to registered callbacks
//! (UI badges, toasts, the D-Bus signal dispatcher).

use std::sync::Arc;

use parking_lot::RwLock;
use smol_str::SmolStr;

use crate::{error::LinkError, session::ConnectionStatus};

/// Events that can be emitted by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
   StatusChanged {
      status: ConnectionStatus,
      device_name: Option<SmolStr>,
   },
   /// The peripheral dropped the link without being asked to.
   LinkLost { device_name: SmolStr },
   ConnectFailed { error: LinkError },
   /// A background reconnect needs the user to start it.
   ReconnectPromptRequired { device_name: SmolStr },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: LinkEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

type Callback = Arc<dyn Fn(&LinkEvent) + Send + Sync>;

/// Callback registry.
#[derive(Default)]
pub struct StatusHub {
   subscribers: RwLock<Vec<Callback>>,
}

impl StatusHub {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   /// Registers `cb` for every event.
   pub fn subscribe<F>(&self, cb: F)
   where
      F: Fn(&LinkEvent) + Send + Sync + 'static,
   {
      self.subscribers.write().push(Arc::new(cb));
   }

   /// Registers `cb` for status changes only.
   pub fn subscribe_status<F>(&self, cb: F)
   where
      F: Fn(ConnectionStatus, Option<&str>) + Send + Sync + 'static,
   {
      self.subscribe(move |event| {
         if let LinkEvent::StatusChanged {
            status,
            device_name,
         } = event
         {
            cb(*status, device_name.as_deref());
         }
      });
   }
}

impl EventBus for StatusHub {
   fn emit(&self, event: LinkEvent) {
      // Callbacks may subscribe from inside a callback; don't hold the lock.
      let subscribers = self.subscribers.read().clone();
      for cb in subscribers {
         cb(&event);
      }
   }
}

#[cfg(test)]
mod tests {
   use parking_lot::Mutex;

   use super::*;

   #[test]
   fn test_status_subscription_filters_events() {
      let hub = StatusHub::new();
      let seen = Arc::new(Mutex::new(Vec::new()));
      let sink = seen.clone();
      hub.subscribe_status(move |status, name| {
         sink.lock().push((status, name.map(SmolStr::new)));
      });

      hub.emit(LinkEvent::ConnectFailed {
         error: LinkError::UserCancelled,
      });
      hub.emit(LinkEvent::StatusChanged {
         status: ConnectionStatus::Connected,
         device_name: Some(SmolStr::new_static("TM-m30")),
      });

      assert_eq!(
         *seen.lock(),
         vec![(ConnectionStatus::Connected, Some(SmolStr::new_static("TM-m30")))]
      );
   }
}
