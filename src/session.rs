//! Link session state.
//!
//! The `Session` is the single in-memory record of which device we talk
//! to, what state the link is in and which operation is running. Every
//! transition goes through a method here so the status, the owned link
//! and the in-flight marker cannot drift apart.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::sync::oneshot;

use crate::{
   bluetooth::link::{ActiveLink, LinkHandle},
   error::LinkError,
};

/// A previously seen peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
   pub id: SmolStr,
   pub name: SmolStr,
}

impl DeviceIdentity {
   pub fn new(id: impl AsRef<str>, name: impl AsRef<str>) -> Self {
      Self {
         id: SmolStr::new(id),
         name: SmolStr::new(name),
      }
   }
}

#[derive(
   Debug,
   Clone,
   Copy,
   Default,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum ConnectionStatus {
   #[default]
   Disconnected,
   Connecting,
   Connected,
}

impl ConnectionStatus {
   /// Whether `self -> next` is an edge of the link state machine.
   pub const fn can_transition(self, next: Self) -> bool {
      matches!(
         (self, next),
         (Self::Disconnected, Self::Connecting)
            | (Self::Connecting, Self::Connected | Self::Disconnected)
            | (Self::Connected, Self::Disconnected)
      )
   }
}

/// What survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
   pub device: Option<DeviceIdentity>,
   pub status: ConnectionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
   /// Started by the user with a device they just picked.
   Manual,
   /// Recovery towards the device on record.
   Reconnect,
}

pub type Waiter = oneshot::Sender<Result<(), LinkError>>;

/// The operation currently holding the session.
#[derive(Debug)]
pub struct InFlight {
   pub kind: AttemptKind,
   pub device: DeviceIdentity,
   pub epoch: u64,
   waiters: Vec<Waiter>,
}

impl InFlight {
   pub fn resolve(self, result: &Result<(), LinkError>) {
      for waiter in self.waiters {
         let _ = waiter.send(result.clone());
      }
   }
}

#[derive(Debug, Default)]
pub struct Session {
   device: Option<DeviceIdentity>,
   status: ConnectionStatus,
   link: Option<ActiveLink>,
   in_flight: Option<InFlight>,
   retry_epoch: u64,
}

impl Session {
   /// Builds the session from the persisted record. A live link cannot
   /// survive a restart, so the status always starts out `Disconnected`.
   pub fn restore(record: Option<PersistedRecord>) -> Self {
      Self {
         device: record.and_then(|r| r.device),
         ..Self::default()
      }
   }

   pub const fn status(&self) -> ConnectionStatus {
      self.status
   }

   pub const fn device(&self) -> Option<&DeviceIdentity> {
      self.device.as_ref()
   }

   pub const fn retry_epoch(&self) -> u64 {
      self.retry_epoch
   }

   pub const fn is_busy(&self) -> bool {
      self.in_flight.is_some()
   }

   pub const fn in_flight(&self) -> Option<&InFlight> {
      self.in_flight.as_ref()
   }

   pub fn connected_device_name(&self) -> Option<SmolStr> {
      match self.status {
         ConnectionStatus::Connected => self.device.as_ref().map(|d| d.name.clone()),
         _ => None,
      }
   }

   pub fn link_handle(&self) -> Option<&LinkHandle> {
      self.link.as_ref().map(ActiveLink::handle)
   }

   pub fn record(&self) -> PersistedRecord {
      PersistedRecord {
         device: self.device.clone(),
         status: self.status,
      }
   }

   fn set_status(&mut self, next: ConnectionStatus) {
      debug_assert!(
         self.status.can_transition(next),
         "illegal transition {} -> {next}",
         self.status
      );
      self.status = next;
   }

   /// Disconnected -> Connecting. Returns the epoch the attempt is tagged with.
   pub fn begin_attempt(
      &mut self,
      kind: AttemptKind,
      device: DeviceIdentity,
   ) -> Result<u64, LinkError> {
      if self.in_flight.is_some() || self.status != ConnectionStatus::Disconnected {
         return Err(LinkError::AlreadyInFlight);
      }
      self.retry_epoch += 1;
      self.set_status(ConnectionStatus::Connecting);
      self.in_flight = Some(InFlight {
         kind,
         device,
         epoch: self.retry_epoch,
         waiters: Vec::new(),
      });
      Ok(self.retry_epoch)
   }

   /// Registers a caller for the outcome of the running attempt.
   pub fn attach(&mut self, waiter: Waiter) {
      match &mut self.in_flight {
         Some(op) => op.waiters.push(waiter),
         None => {
            let _ = waiter.send(Err(LinkError::NotConnected));
         },
      }
   }

   /// Attaches a caller to the reconnect already running. Hands the waiter
   /// back if there is none to join.
   pub fn join_reconnect(&mut self, waiter: Waiter) -> Result<(), Waiter> {
      match &mut self.in_flight {
         Some(op) if op.kind == AttemptKind::Reconnect => {
            op.waiters.push(waiter);
            Ok(())
         },
         _ => Err(waiter),
      }
   }

   /// Connecting -> Connected.
   pub fn complete_connected(&mut self, link: ActiveLink) -> Option<InFlight> {
      let op = self.in_flight.take()?;
      self.set_status(ConnectionStatus::Connected);
      self.device = Some(op.device.clone());
      self.link = Some(link);
      Some(op)
   }

   /// Connecting -> Disconnected. The device on record is left untouched.
   pub fn complete_failed(&mut self) -> Option<InFlight> {
      let op = self.in_flight.take()?;
      self.set_status(ConnectionStatus::Disconnected);
      Some(op)
   }

   /// Connected -> Disconnected, on request or on loss. Advances the epoch
   /// so timers and watchers armed for the old link become inert.
   pub fn drop_link(&mut self) -> Option<ActiveLink> {
      if self.status != ConnectionStatus::Connected {
         return None;
      }
      self.set_status(ConnectionStatus::Disconnected);
      self.retry_epoch += 1;
      self.link.take()
   }

   /// Forgets everything, including the device on record.
   pub fn clear(&mut self) -> (Option<ActiveLink>, Option<InFlight>) {
      let link = self.link.take();
      let op = self.in_flight.take();
      self.device = None;
      self.status = ConnectionStatus::Disconnected;
      self.retry_epoch += 1;
      (link, op)
   }

   /// `link` is held exactly while connected, and `Connecting` always has
   /// an operation behind it.
   pub fn invariants_hold(&self) -> bool {
      let link_matches = self.link.is_some() == (self.status == ConnectionStatus::Connected);
      let busy_matches =
         (self.status == ConnectionStatus::Connecting) == self.in_flight.is_some();
      link_matches && busy_matches
   }
}

#[cfg(test)]
mod tests {
   use smol_str::SmolStr;
   use tokio::io::duplex;

   use super::*;
   use crate::bluetooth::link;

   fn printer() -> DeviceIdentity {
      DeviceIdentity::new("00:11:22:33:44:55", "TM-m30")
   }

   fn fake_link() -> ActiveLink {
      let (ours, theirs) = duplex(16);
      std::mem::forget(theirs);
      link::spawn(SmolStr::new_static("test"), ours).into_parts().0
   }

   #[test]
   fn test_restore_forces_disconnected() {
      let session = Session::restore(Some(PersistedRecord {
         device: Some(printer()),
         status: ConnectionStatus::Connected,
      }));
      assert_eq!(session.status(), ConnectionStatus::Disconnected);
      assert_eq!(session.device(), Some(&printer()));
      assert!(session.invariants_hold());
   }

   #[test]
   fn test_transition_table() {
      use ConnectionStatus::*;
      assert!(Disconnected.can_transition(Connecting));
      assert!(Connecting.can_transition(Connected));
      assert!(Connecting.can_transition(Disconnected));
      assert!(Connected.can_transition(Disconnected));
      assert!(!Disconnected.can_transition(Connected));
      assert!(!Connected.can_transition(Connecting));
   }

   #[test]
   fn test_second_attempt_rejected() {
      let mut session = Session::default();
      session
         .begin_attempt(AttemptKind::Manual, printer())
         .unwrap();
      assert_eq!(
         session.begin_attempt(AttemptKind::Manual, printer()),
         Err(LinkError::AlreadyInFlight)
      );
      assert_eq!(session.status(), ConnectionStatus::Connecting);
   }

   #[test]
   fn test_join_only_collapses_reconnects() {
      let mut session = Session::default();
      session
         .begin_attempt(AttemptKind::Manual, printer())
         .unwrap();
      let (tx, _rx) = oneshot::channel();
      assert!(session.join_reconnect(tx).is_err());

      session.complete_failed();
      session
         .begin_attempt(AttemptKind::Reconnect, printer())
         .unwrap();
      let (tx, _rx) = oneshot::channel();
      assert!(session.join_reconnect(tx).is_ok());
   }

   #[test]
   fn test_failed_attempt_keeps_previous_device() {
      let mut session = Session::restore(Some(PersistedRecord {
         device: Some(printer()),
         status: ConnectionStatus::Disconnected,
      }));
      let other = DeviceIdentity::new("AA:BB:CC:DD:EE:FF", "Other");
      session.begin_attempt(AttemptKind::Manual, other).unwrap();
      session.complete_failed();
      assert_eq!(session.device(), Some(&printer()));
      assert_eq!(session.status(), ConnectionStatus::Disconnected);
   }

   #[tokio::test]
   async fn test_invariants_across_lifecycle() {
      let mut session = Session::default();
      assert!(session.invariants_hold());

      let epoch = session
         .begin_attempt(AttemptKind::Manual, printer())
         .unwrap();
      assert!(session.invariants_hold());
      assert_eq!(session.in_flight().map(|op| op.epoch), Some(epoch));

      session.complete_connected(fake_link());
      assert!(session.invariants_hold());
      assert!(session.link_handle().is_some());
      assert_eq!(session.connected_device_name().as_deref(), Some("TM-m30"));

      let before = session.retry_epoch();
      assert!(session.drop_link().is_some());
      assert!(session.invariants_hold());
      assert!(session.link_handle().is_none());
      assert!(session.retry_epoch() > before);
      assert_eq!(
         session.record(),
         PersistedRecord {
            device: Some(printer()),
            status: ConnectionStatus::Disconnected,
         }
      );

      assert!(session.drop_link().is_none());
   }
}
