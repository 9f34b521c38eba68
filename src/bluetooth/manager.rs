//! Connection manager for the printer link.
//!
//! This module owns the single link to the paired peripheral. All state
//! changes happen inside one actor task; link attempts and loss watchers
//! run on the side and report back through a loopback channel tagged with
//! the epoch they were started under, so a result that arrives after the
//! user moved on is recognised and dropped.

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   bluetooth::{
      link::{Link, LinkHandle, LinkLoss},
      radio::Radio,
      recognition::ServiceFilter,
      scanner::{CapabilityGate, Scanner},
      scheduler::{ReconnectScheduler, SchedulerEvent},
   },
   config::{Config, FallbackPolicy},
   error::LinkError,
   event::{EventBus, EventSender, LinkEvent, StatusHub},
   session::{AttemptKind, ConnectionStatus, DeviceIdentity, Session, Waiter},
   store::Persistence,
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;
/// Scheduler events beyond this are dropped rather than queued
const SCHEDULER_BUFFER_SIZE: usize = 2;

/// Timing and policy knobs for the manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
   pub filter: ServiceFilter,
   /// Delay before the single retry after an unsolicited loss
   pub retry_delay: Duration,
   /// Period of the background reconnect check
   pub poll_interval: Duration,
   /// Upper bound for opening the link once the device is retained
   pub connect_timeout: Duration,
   /// Upper bound for the discovery + pairing pass of the slow path
   pub pair_timeout: Duration,
   pub fallback: FallbackPolicy,
}

impl ManagerOptions {
   pub fn from_config(config: &Config) -> Self {
      Self {
         filter: ServiceFilter::from_config(config),
         retry_delay: config.retry_delay(),
         poll_interval: config.poll_interval(),
         connect_timeout: config.connect_timeout(),
         pair_timeout: config.pair_timeout(),
         fallback: config.reconnect_fallback,
      }
   }
}

impl Default for ManagerOptions {
   fn default() -> Self {
      Self::from_config(&Config::default())
   }
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   Connect(DeviceIdentity, Waiter),
   Disconnect(oneshot::Sender<Result<(), LinkError>>),
   ReconnectToLast(Waiter),
   GetStatus(oneshot::Sender<ConnectionStatus>),
   GetDeviceName(oneshot::Sender<Option<SmolStr>>),
   BorrowLink(oneshot::Sender<Option<LinkHandle>>),
   Logout(oneshot::Sender<()>),
   Shutdown(oneshot::Sender<()>),
}

/// What a spawned attempt needs to know about timing and policy.
#[derive(Debug, Clone, Copy)]
struct AttemptLimits {
   connect_timeout: Duration,
   pair_timeout: Duration,
   fallback: FallbackPolicy,
}

#[derive(Debug)]
enum Loopback {
   AttemptFinished {
      epoch: u64,
      result: Result<Link, LinkError>,
   },
   LinkLost {
      epoch: u64,
   },
}

// === Public handle ===

/// Handle to the connection manager.
///
/// This type is cheaply cloneable; all clones talk to the same session.
pub struct ConnectionManager<R> {
   inbox: mpsc::Sender<ManagerCommand>,
   radio: Arc<R>,
   gate: Arc<CapabilityGate>,
   scanner: Arc<Scanner<R>>,
   hub: Arc<StatusHub>,
}

impl<R> Clone for ConnectionManager<R> {
   fn clone(&self) -> Self {
      Self {
         inbox: self.inbox.clone(),
         radio: self.radio.clone(),
         gate: self.gate.clone(),
         scanner: self.scanner.clone(),
         hub: self.hub.clone(),
      }
   }
}

impl<R: Radio> ConnectionManager<R> {
   /// Restores the session from `persistence` and starts the manager.
   pub fn new(radio: Arc<R>, persistence: Persistence, options: ManagerOptions) -> Self {
      let gate = Arc::new(CapabilityGate::default());
      let hub = StatusHub::new();
      let scanner = Arc::new(Scanner::new(
         radio.clone(),
         gate.clone(),
         options.filter.clone(),
      ));

      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(
         ManagerActor::new(
            radio.clone(),
            gate.clone(),
            hub.clone(),
            persistence,
            options,
            command_rx,
         )
         .run(),
      );

      Self {
         inbox: command_tx,
         radio,
         gate,
         scanner,
         hub,
      }
   }

   async fn request<T>(
      &self,
      make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
   ) -> Result<T, LinkError> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| LinkError::ManagerShutdown)?;
      rx.await.map_err(|_| LinkError::ManagerShutdown)
   }

   /// Opens the device picker. Has no effect on the link status.
   pub async fn scan(&self) -> Result<DeviceIdentity, LinkError> {
      self.scanner.scan().await
   }

   pub fn cancel_scan(&self) {
      self.scanner.cancel();
   }

   pub async fn connect(&self, device: DeviceIdentity) -> Result<(), LinkError> {
      self.gate.check(&*self.radio).await?;
      self
         .request(|tx| ManagerCommand::Connect(device, tx))
         .await?
   }

   pub async fn disconnect(&self) -> Result<(), LinkError> {
      self.request(ManagerCommand::Disconnect).await?
   }

   pub async fn reconnect_to_last(&self) -> Result<(), LinkError> {
      self.request(ManagerCommand::ReconnectToLast).await?
   }

   pub async fn status(&self) -> ConnectionStatus {
      self
         .request(ManagerCommand::GetStatus)
         .await
         .unwrap_or_default()
   }

   pub async fn connected_device_name(&self) -> Option<SmolStr> {
      self
         .request(ManagerCommand::GetDeviceName)
         .await
         .ok()
         .flatten()
   }

   /// Lends out the live link. `None` unless connected; holders must stop
   /// using it once a disconnect is reported.
   pub async fn borrow_active_link(&self) -> Option<LinkHandle> {
      self
         .request(ManagerCommand::BorrowLink)
         .await
         .ok()
         .flatten()
   }

   pub fn subscribe<F>(&self, cb: F)
   where
      F: Fn(&LinkEvent) + Send + Sync + 'static,
   {
      self.hub.subscribe(cb);
   }

   pub fn subscribe_status<F>(&self, cb: F)
   where
      F: Fn(ConnectionStatus, Option<&str>) + Send + Sync + 'static,
   {
      self.hub.subscribe_status(cb);
   }

   /// Ends the session: closes the link, stops background reconnects and
   /// forgets the device on record. The next `connect` starts a new session.
   pub async fn logout(&self) -> Result<(), LinkError> {
      self.scanner.cancel();
      self.request(ManagerCommand::Logout).await
   }

   /// Stops the manager at process exit, keeping the device on record.
   pub async fn shutdown(&self) {
      self.scanner.cancel();
      let _ = self.request(ManagerCommand::Shutdown).await;
   }
}

// === Manager Actor ===

struct ManagerActor<R> {
   radio: Arc<R>,
   gate: Arc<CapabilityGate>,
   events: EventSender,
   persistence: Persistence,
   options: ManagerOptions,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<Loopback>,
   loopback_tx: mpsc::Sender<Loopback>,
   scheduler: ReconnectScheduler,
   scheduler_tx: mpsc::Sender<SchedulerEvent>,
   scheduler_rx: mpsc::Receiver<SchedulerEvent>,

   // State
   session: Session,
   loss_watch: Option<JoinHandle<()>>,
   /// Set by logout until the next manual connect
   logged_out: bool,
}

impl<R: Radio> ManagerActor<R> {
   fn new(
      radio: Arc<R>,
      gate: Arc<CapabilityGate>,
      hub: Arc<StatusHub>,
      persistence: Persistence,
      options: ManagerOptions,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (scheduler_tx, scheduler_rx) = mpsc::channel(SCHEDULER_BUFFER_SIZE);
      let scheduler = ReconnectScheduler::new(
         scheduler_tx.clone(),
         options.retry_delay,
         options.poll_interval,
      );

      let session = Session::restore(persistence.load());
      if let Some(device) = session.device() {
         info!("Restored {} ({}) from the link store", device.name, device.id);
      }

      Self {
         radio,
         gate,
         events: hub,
         persistence,
         options,
         command_rx,
         loopback_rx,
         loopback_tx,
         scheduler,
         scheduler_tx,
         scheduler_rx,
         session,
         loss_watch: None,
         logged_out: false,
      }
   }

   async fn run(mut self) {
      info!("Connection manager starting up");
      self.scheduler.start_periodic();

      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Connection manager shutting down");
                  break;
               };
               if !self.handle_command(cmd).await {
                  break;
               }
            }
            Some(msg) = self.loopback_rx.recv() => {
               self.handle_loopback(msg).await;
            }
            Some(event) = self.scheduler_rx.recv() => {
               self.handle_scheduler_event(event).await;
            }
         }
         debug_assert!(self.session.invariants_hold());
      }

      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) -> bool {
      match cmd {
         ManagerCommand::Connect(device, reply) => {
            self.connect(device, reply);
         },
         ManagerCommand::Disconnect(reply) => {
            let result = self.disconnect().await;
            let _ = reply.send(result);
         },
         ManagerCommand::ReconnectToLast(reply) => {
            self.reconnect_to_last(Some(reply)).await;
         },
         ManagerCommand::GetStatus(reply) => {
            let _ = reply.send(self.session.status());
         },
         ManagerCommand::GetDeviceName(reply) => {
            let _ = reply.send(self.session.connected_device_name());
         },
         ManagerCommand::BorrowLink(reply) => {
            let _ = reply.send(self.session.link_handle().cloned());
         },
         ManagerCommand::Logout(reply) => {
            self.logout().await;
            let _ = reply.send(());
         },
         ManagerCommand::Shutdown(reply) => {
            self.cleanup().await;
            let _ = reply.send(());
            return false;
         },
      }
      true
   }

   async fn handle_loopback(&mut self, msg: Loopback) {
      match msg {
         Loopback::AttemptFinished { epoch, result } => {
            self.handle_attempt_finished(epoch, result).await;
         },
         Loopback::LinkLost { epoch } => {
            self.handle_link_lost(epoch);
         },
      }
   }

   async fn handle_scheduler_event(&mut self, event: SchedulerEvent) {
      if self.logged_out {
         debug!("Scheduler event {event:?} after logout dropped");
         return;
      }
      if self.session.status() != ConnectionStatus::Disconnected || self.session.is_busy() {
         debug!("Scheduler event {event:?} ignored, link is {}", self.session.status());
         return;
      }

      match event {
         SchedulerEvent::Tick => {
            if self.session.device().is_none() {
               return;
            }
            debug!("Periodic check found the link down");
         },
         SchedulerEvent::RetryDue { epoch } => {
            if epoch != self.session.retry_epoch() {
               debug!(
                  "Retry for epoch {epoch} superseded (now {})",
                  self.session.retry_epoch()
               );
               return;
            }
            info!("Retrying link after unsolicited loss");
         },
      }
      self.reconnect_to_last(None).await;
   }

   // === Operations ===

   fn connect(&mut self, device: DeviceIdentity, reply: Waiter) {
      match self
         .session
         .begin_attempt(AttemptKind::Manual, device.clone())
      {
         Ok(epoch) => {
            info!("Connecting to {} ({})", device.name, device.id);
            if self.logged_out {
               self.resume_session();
            }
            self.session.attach(reply);
            self.notify_status();
            self.spawn_attempt(epoch, device, AttemptKind::Manual);
         },
         Err(e) => {
            debug!("Connect to {} rejected: {e}", device.name);
            let _ = reply.send(Err(e));
         },
      }
   }

   async fn disconnect(&mut self) -> Result<(), LinkError> {
      if self.session.is_busy() {
         return Err(LinkError::AlreadyInFlight);
      }
      let Some(link) = self.session.drop_link() else {
         return Ok(());
      };

      self.disarm_loss_watch();
      link.close().await;
      if let Some(device) = self.session.device() {
         info!("Disconnected from {}", device.name);
      }
      self.persistence.save(&self.session.record());
      self.notify_status();
      Ok(())
   }

   async fn reconnect_to_last(&mut self, waiter: Option<Waiter>) {
      let waiter = match waiter {
         Some(waiter) if self.session.is_busy() => {
            // Collapse onto a reconnect that is already running.
            if let Err(waiter) = self.session.join_reconnect(waiter) {
               let _ = waiter.send(Err(LinkError::AlreadyInFlight));
            }
            return;
         },
         other => other,
      };

      match self.begin_reconnect().await {
         Ok(true) => {
            if let Some(waiter) = waiter {
               self.session.attach(waiter);
            }
         },
         Ok(false) => {
            if let Some(waiter) = waiter {
               let _ = waiter.send(Ok(()));
            }
         },
         Err(e) => {
            debug!("Reconnect not started: {e}");
            if let Some(waiter) = waiter {
               let _ = waiter.send(Err(e));
            }
         },
      }
   }

   /// Starts a reconnect. `Ok(false)` means the link is already up.
   async fn begin_reconnect(&mut self) -> Result<bool, LinkError> {
      if self.session.status() == ConnectionStatus::Connected {
         return Ok(false);
      }
      let device = self.last_device().ok_or(LinkError::NoPersistedDevice)?;
      self.gate.check(&*self.radio).await?;

      let epoch = self
         .session
         .begin_attempt(AttemptKind::Reconnect, device.clone())?;
      info!("Reconnecting to {} ({})", device.name, device.id);
      self.notify_status();
      self.spawn_attempt(epoch, device, AttemptKind::Reconnect);
      Ok(true)
   }

   fn last_device(&self) -> Option<DeviceIdentity> {
      self
         .session
         .device()
         .cloned()
         .or_else(|| self.persistence.load().and_then(|record| record.device))
   }

   /// Brings background reconnects back after a logout.
   fn resume_session(&mut self) {
      info!("Starting a new session after logout");
      self.scheduler = ReconnectScheduler::new(
         self.scheduler_tx.clone(),
         self.options.retry_delay,
         self.options.poll_interval,
      );
      self.scheduler.start_periodic();
      self.logged_out = false;
   }

   fn spawn_attempt(&self, epoch: u64, device: DeviceIdentity, kind: AttemptKind) {
      let radio = self.radio.clone();
      let loopback = self.loopback_tx.clone();
      let limits = AttemptLimits {
         connect_timeout: self.options.connect_timeout,
         pair_timeout: self.options.pair_timeout,
         fallback: self.options.fallback,
      };

      tokio::spawn(async move {
         let result = open_link(&*radio, &device, kind, limits).await;
         if let Err(e) = loopback
            .send(Loopback::AttemptFinished { epoch, result })
            .await
         {
            warn!("Dropping link attempt result: {e}");
         }
      });
   }

   async fn handle_attempt_finished(&mut self, epoch: u64, result: Result<Link, LinkError>) {
      if self.session.in_flight().map(|op| op.epoch) != Some(epoch) {
         debug!("Discarding result of superseded attempt {epoch}");
         if let Ok(link) = result {
            link.into_parts().0.close().await;
         }
         return;
      }

      match result {
         Ok(link) => {
            let (active, loss) = link.into_parts();
            let Some(op) = self.session.complete_connected(active) else {
               return;
            };
            info!("Link to {} ({}) established", op.device.name, op.device.id);
            self.persistence.save(&self.session.record());
            self.arm_loss_watch(epoch, loss);
            self.notify_status();
            op.resolve(&Ok(()));
         },
         Err(e) => {
            let Some(op) = self.session.complete_failed() else {
               return;
            };
            warn!("Link to {} failed: {e}", op.device.name);
            if e == LinkError::UserGestureRequired {
               self.events.emit(LinkEvent::ReconnectPromptRequired {
                  device_name: op.device.name.clone(),
               });
            }
            self.events.emit(LinkEvent::ConnectFailed { error: e.clone() });
            self.notify_status();
            op.resolve(&Err(e));
         },
      }
   }

   fn handle_link_lost(&mut self, epoch: u64) {
      if epoch != self.session.retry_epoch()
         || self.session.status() != ConnectionStatus::Connected
      {
         debug!("Ignoring loss of a link that is already gone (epoch {epoch})");
         return;
      }

      self.loss_watch = None;
      drop(self.session.drop_link());
      let device_name = self
         .session
         .device()
         .map(|d| d.name.clone())
         .unwrap_or_default();
      warn!("Link to {device_name} lost");

      self.persistence.save(&self.session.record());
      self.scheduler.arm_retry(self.session.retry_epoch());
      self.events.emit(LinkEvent::LinkLost { device_name });
      self.notify_status();
   }

   fn arm_loss_watch(&mut self, epoch: u64, loss: LinkLoss) {
      self.disarm_loss_watch();
      let loopback = self.loopback_tx.clone();
      self.loss_watch = Some(tokio::spawn(async move {
         if let Some(cause) = loss.lost().await {
            debug!("Link loss detected: {cause:?}");
            let _ = loopback.send(Loopback::LinkLost { epoch }).await;
         }
      }));
   }

   fn disarm_loss_watch(&mut self) {
      if let Some(handle) = self.loss_watch.take() {
         handle.abort();
      }
   }

   fn notify_status(&self) {
      let status = self.session.status();
      let device = match status {
         ConnectionStatus::Connecting => self.session.in_flight().map(|op| &op.device),
         _ => self.session.device(),
      };
      self.events.emit(LinkEvent::StatusChanged {
         status,
         device_name: device.map(|d| d.name.clone()),
      });
   }

   async fn logout(&mut self) {
      info!("Logging out, forgetting the linked device");
      self.scheduler.cancel();
      self.disarm_loss_watch();

      let (link, op) = self.session.clear();
      if let Some(link) = link {
         link.close().await;
      }
      if let Some(op) = op {
         op.resolve(&Err(LinkError::ManagerShutdown));
      }
      self.persistence.clear();
      self.logged_out = true;
      self.notify_status();
   }

   async fn cleanup(&mut self) {
      debug!("Cleaning up connection manager");
      self.scheduler.cancel();
      self.disarm_loss_watch();

      if let Some(op) = self.session.complete_failed() {
         op.resolve(&Err(LinkError::ManagerShutdown));
      }
      if let Some(link) = self.session.drop_link() {
         link.close().await;
         self.persistence.save(&self.session.record());
      }
   }
}

async fn establish_within<R: Radio>(
   radio: &R,
   device: &DeviceIdentity,
   timeout: Duration,
) -> Result<Link, LinkError> {
   match time::timeout(timeout, radio.establish_link(device)).await {
      Ok(result) => result,
      Err(_) => {
         warn!("Link attempt to {} timed out", device.name);
         Err(LinkError::establish_failed("timed out"))
      },
   }
}

/// Fast path first; the slow path only when the host forgot the device and
/// the policy allows it without a user gesture. Each step has its own bound.
async fn open_link<R: Radio>(
   radio: &R,
   device: &DeviceIdentity,
   kind: AttemptKind,
   limits: AttemptLimits,
) -> Result<Link, LinkError> {
   match establish_within(radio, device, limits.connect_timeout).await {
      Err(LinkError::DeviceNotRetained) => {},
      other => return other,
   }

   if kind == AttemptKind::Reconnect && limits.fallback == FallbackPolicy::PromptUser {
      info!("{} is no longer retained, waiting for the user", device.name);
      return Err(LinkError::UserGestureRequired);
   }

   info!("{} is no longer retained, discovering and pairing", device.name);
   match time::timeout(limits.pair_timeout, radio.discover_and_pair(device)).await {
      Ok(result) => result?,
      Err(_) => {
         warn!("Pairing with {} timed out", device.name);
         return Err(LinkError::establish_failed("pairing timed out"));
      },
   }
   establish_within(radio, device, limits.connect_timeout).await
}
