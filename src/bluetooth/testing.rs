//! Scripted radio for exercising the connection core without hardware.
//!
//! Links are in-memory duplex pipes; the far end is kept here so a test
//! can read what was written or drop it to simulate the printer going
//! out of range.

use std::{
   collections::{HashSet, VecDeque},
   sync::atomic::{AtomicBool, AtomicUsize, Ordering},
   time::Duration,
};

use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   io::{DuplexStream, duplex},
   sync::Semaphore,
   time,
};
use tokio_util::sync::CancellationToken;

use crate::{
   bluetooth::{
      link::{self, Link},
      radio::Radio,
      recognition::ServiceFilter,
   },
   error::LinkError,
   session::DeviceIdentity,
};

pub struct FakeRadio {
   available: bool,
   pub availability_queries: AtomicUsize,
   pub picks: AtomicUsize,
   hold_picker: AtomicBool,
   pick_results: Mutex<VecDeque<Result<DeviceIdentity, LinkError>>>,
   /// Outcomes for upcoming `establish_link` calls; success when empty.
   establish_results: Mutex<VecDeque<Result<(), LinkError>>>,
   /// Device ids the host has forgotten.
   forgotten: Mutex<HashSet<SmolStr>>,
   attempts: Mutex<Vec<SmolStr>>,
   pub pairings: AtomicUsize,
   pair_delay: Mutex<Duration>,
   peers: Mutex<Vec<(SmolStr, DuplexStream)>>,
   stall: AtomicBool,
   released: Semaphore,
}

impl FakeRadio {
   pub fn new() -> Self {
      Self::with_availability(true)
   }

   pub fn unavailable() -> Self {
      Self::with_availability(false)
   }

   fn with_availability(available: bool) -> Self {
      Self {
         available,
         availability_queries: AtomicUsize::new(0),
         picks: AtomicUsize::new(0),
         hold_picker: AtomicBool::new(false),
         pick_results: Mutex::new(VecDeque::new()),
         establish_results: Mutex::new(VecDeque::new()),
         forgotten: Mutex::new(HashSet::new()),
         attempts: Mutex::new(Vec::new()),
         pairings: AtomicUsize::new(0),
         pair_delay: Mutex::new(Duration::ZERO),
         peers: Mutex::new(Vec::new()),
         stall: AtomicBool::new(false),
         released: Semaphore::new(0),
      }
   }

   pub fn queue_pick(&self, result: Result<DeviceIdentity, LinkError>) {
      self.pick_results.lock().push_back(result);
   }

   /// Makes the picker stay open until cancelled.
   pub fn hold_picker(&self) {
      self.hold_picker.store(true, Ordering::SeqCst);
   }

   pub fn queue_establish(&self, result: Result<(), LinkError>) {
      self.establish_results.lock().push_back(result);
   }

   /// Makes link attempts hang until `release_link` is called.
   pub fn stall_links(&self) {
      self.stall.store(true, Ordering::SeqCst);
   }

   /// Lets one stalled link attempt proceed.
   pub fn release_link(&self) {
      self.released.add_permits(1);
   }

   /// Makes discovery + pairing take `delay` of (virtual) time.
   pub fn set_pair_delay(&self, delay: Duration) {
      *self.pair_delay.lock() = delay;
   }

   pub fn forget(&self, device: &DeviceIdentity) {
      self.forgotten.lock().insert(device.id.clone());
   }

   /// Every `establish_link` call so far, by device id.
   pub fn attempts(&self) -> Vec<SmolStr> {
      self.attempts.lock().clone()
   }

   pub fn attempts_for(&self, device: &DeviceIdentity) -> usize {
      self.attempts.lock().iter().filter(|id| **id == device.id).count()
   }

   /// Drops the far end of every link to `device`.
   pub fn drop_peer(&self, device: &DeviceIdentity) {
      self.peers.lock().retain(|(id, _)| *id != device.id);
   }

   /// Takes the far end of the most recent link to `device`.
   pub fn take_peer(&self, device: &DeviceIdentity) -> Option<DuplexStream> {
      let mut peers = self.peers.lock();
      let idx = peers.iter().rposition(|(id, _)| *id == device.id)?;
      Some(peers.remove(idx).1)
   }
}

impl Radio for FakeRadio {
   async fn is_available(&self) -> bool {
      self.availability_queries.fetch_add(1, Ordering::SeqCst);
      self.available
   }

   async fn pick_device(
      &self,
      _filter: &ServiceFilter,
      cancel: CancellationToken,
   ) -> Result<DeviceIdentity, LinkError> {
      self.picks.fetch_add(1, Ordering::SeqCst);
      if self.hold_picker.load(Ordering::SeqCst) {
         cancel.cancelled().await;
         return Err(LinkError::UserCancelled);
      }
      self
         .pick_results
         .lock()
         .pop_front()
         .unwrap_or(Err(LinkError::UserCancelled))
   }

   async fn establish_link(&self, device: &DeviceIdentity) -> Result<Link, LinkError> {
      self.attempts.lock().push(device.id.clone());
      if self.stall.load(Ordering::SeqCst)
         && let Ok(permit) = self.released.acquire().await
      {
         permit.forget();
      }
      if self.forgotten.lock().contains(&device.id) {
         return Err(LinkError::DeviceNotRetained);
      }
      let scripted = self.establish_results.lock().pop_front();
      if let Some(Err(e)) = scripted {
         return Err(e);
      }

      let (ours, theirs) = duplex(4096);
      self.peers.lock().push((device.id.clone(), theirs));
      Ok(link::spawn(device.name.clone(), ours))
   }

   async fn discover_and_pair(&self, device: &DeviceIdentity) -> Result<(), LinkError> {
      self.pairings.fetch_add(1, Ordering::SeqCst);
      let delay = *self.pair_delay.lock();
      if !delay.is_zero() {
         time::sleep(delay).await;
      }
      self.forgotten.lock().remove(&device.id);
      Ok(())
   }
}
