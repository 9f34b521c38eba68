//! Capability gate and device scanner.

use std::sync::{
   Arc,
   atomic::{AtomicU64, Ordering},
};

use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::{
   bluetooth::{radio::Radio, recognition::ServiceFilter},
   error::LinkError,
   session::DeviceIdentity,
};

/// Asks the host once whether a radio is present and remembers the answer
/// for the rest of the process.
#[derive(Debug, Default)]
pub struct CapabilityGate {
   supported: OnceCell<bool>,
}

impl CapabilityGate {
   pub async fn supports<R: Radio>(&self, radio: &R) -> bool {
      *self
         .supported
         .get_or_init(|| async {
            let available = radio.is_available().await;
            if !available {
               warn!("No usable Bluetooth adapter, link operations are disabled");
            }
            available
         })
         .await
   }

   pub async fn check<R: Radio>(&self, radio: &R) -> Result<(), LinkError> {
      if self.supports(radio).await {
         Ok(())
      } else {
         Err(LinkError::CapabilityUnavailable)
      }
   }
}

/// One-shot device picker. Each call is a separate user gesture; starting
/// a new scan dismisses a picker that is still open.
pub struct Scanner<R> {
   radio: Arc<R>,
   gate: Arc<CapabilityGate>,
   filter: ServiceFilter,
   next_scan: AtomicU64,
   active: Mutex<Option<(u64, CancellationToken)>>,
}

impl<R: Radio> Scanner<R> {
   pub fn new(radio: Arc<R>, gate: Arc<CapabilityGate>, filter: ServiceFilter) -> Self {
      Self {
         radio,
         gate,
         filter,
         next_scan: AtomicU64::new(0),
         active: Mutex::new(None),
      }
   }

   pub async fn scan(&self) -> Result<DeviceIdentity, LinkError> {
      self.gate.check(&*self.radio).await?;

      let id = self.next_scan.fetch_add(1, Ordering::Relaxed);
      let token = CancellationToken::new();
      if let Some((_, previous)) = self.active.lock().replace((id, token.clone())) {
         previous.cancel();
      }

      let result = self.radio.pick_device(&self.filter, token).await;

      {
         let mut active = self.active.lock();
         if active.as_ref().is_some_and(|(current, _)| *current == id) {
            *active = None;
         }
      }

      match &result {
         Ok(device) => info!("Picked {} ({})", device.name, device.id),
         Err(e) => info!("Scan ended without a device: {e}"),
      }
      result
   }

   /// Dismisses the open picker, if any.
   pub fn cancel(&self) {
      if let Some((_, token)) = self.active.lock().take() {
         token.cancel();
      }
   }
}
