//! Error types for the printer link service.
//!
//! `LinkError` is the taxonomy the connection core reports to callers and
//! the UI. `ServiceError` covers everything the daemon itself can run
//! into: BlueZ, D-Bus, I/O, configuration and the persistent store.

use smol_str::SmolStr;
use thiserror::Error;

/// Outcome of a link operation.
///
/// Cloneable so one attempt's outcome can be handed to every caller that
/// joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
   #[error("Bluetooth is not available on this host")]
   CapabilityUnavailable,

   #[error("Device picker was dismissed")]
   UserCancelled,

   #[error("Bluetooth permission denied")]
   PermissionDenied,

   #[error("Failed to establish link: {0}")]
   LinkEstablishFailed(SmolStr),

   #[error("Link lost")]
   LinkLost,

   #[error("Another link operation is in flight")]
   AlreadyInFlight,

   #[error("No device on record")]
   NoPersistedDevice,

   #[error("Device is no longer retained by the host")]
   DeviceNotRetained,

   #[error("Reconnecting requires a user gesture")]
   UserGestureRequired,

   #[error("No active link")]
   NotConnected,

   #[error("Link write timed out")]
   WriteTimeout,

   #[error("Connection manager has been shut down")]
   ManagerShutdown,
}

impl LinkError {
   /// Internal control-flow signals that are never shown to the user.
   pub const fn is_internal(&self) -> bool {
      matches!(self, Self::AlreadyInFlight | Self::DeviceNotRetained)
   }

   pub fn establish_failed(reason: impl AsRef<str>) -> Self {
      Self::LinkEstablishFailed(SmolStr::new(reason))
   }
}

/// Main error type for the daemon.
#[derive(Error, Debug)]
pub enum ServiceError {
   #[error(transparent)]
   Link(#[from] LinkError),

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Store error: {0}")]
   Store(#[from] heed::Error),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("Could not find local data directory")]
   DataDirNotFound,

   #[error("Invalid configuration: {0}")]
   InvalidConfig(String),

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `ServiceError`.
pub type Result<T> = std::result::Result<T, ServiceError>;
