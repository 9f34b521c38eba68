//! Configuration management for the printer link service.
//!
//! This module handles loading and saving configuration from disk,
//! including the device filter, link parameters and reconnect timing.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ServiceError};

/// Serial Port Profile, spoken by most classic receipt printers.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);
/// Vendor service advertised by common thermal printers.
pub const THERMAL_PRINTER_UUID: Uuid = Uuid::from_u128(0x000018f0_0000_1000_8000_00805f9b34fb);

/// What a background reconnect does when the host no longer retains the
/// device and a full discovery + pairing pass would be needed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
   /// Run discovery and pairing without asking.
   Automatic,
   /// Give up and ask the UI to show a "tap to reconnect" prompt.
   #[default]
   PromptUser,
}

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// Adapter name (e.g. `hci0`); the default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_service_uuids")]
   pub service_uuids: Vec<Uuid>,

   /// Case-insensitive substrings matched against device names.
   #[serde(default)]
   pub name_patterns: Vec<String>,

   #[serde(default = "default_rfcomm_channel")]
   pub rfcomm_channel: u8,

   #[serde(default = "default_retry_delay_ms")]
   pub retry_delay_ms: u64,

   #[serde(default = "default_poll_interval")]
   pub poll_interval: u64,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   #[serde(default = "default_scan_timeout")]
   pub scan_timeout_sec: u64,

   #[serde(default)]
   pub reconnect_fallback: FallbackPolicy,
}

fn default_service_uuids() -> Vec<Uuid> {
   vec![SPP_UUID, THERMAL_PRINTER_UUID]
}

const fn default_rfcomm_channel() -> u8 {
   1
}

const fn default_retry_delay_ms() -> u64 {
   2500
}

const fn default_poll_interval() -> u64 {
   30
}

const fn default_connect_timeout() -> u64 {
   20
}

const fn default_scan_timeout() -> u64 {
   30
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         service_uuids: default_service_uuids(),
         name_patterns: vec![],
         rfcomm_channel: default_rfcomm_channel(),
         retry_delay_ms: default_retry_delay_ms(),
         poll_interval: default_poll_interval(),
         connect_timeout_sec: default_connect_timeout(),
         scan_timeout_sec: default_scan_timeout(),
         reconnect_fallback: FallbackPolicy::default(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         let config: Self = toml::from_str(&contents)?;
         config.validate()?;
         Ok(config)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("POSLINK_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(ServiceError::ConfigDirNotFound);
      };

      Ok(config_dir.join("poslinkd").join("config.toml"))
   }

   /// Rejects values that would disable or break the link timers.
   pub fn validate(&self) -> Result<()> {
      if self.poll_interval == 0 {
         return Err(ServiceError::InvalidConfig(
            "poll_interval must be at least 1 second".into(),
         ));
      }
      if self.connect_timeout_sec == 0 {
         return Err(ServiceError::InvalidConfig(
            "connect_timeout_sec must be at least 1 second".into(),
         ));
      }
      if self.scan_timeout_sec == 0 {
         return Err(ServiceError::InvalidConfig(
            "scan_timeout_sec must be at least 1 second".into(),
         ));
      }
      if !(1..=30).contains(&self.rfcomm_channel) {
         return Err(ServiceError::InvalidConfig(format!(
            "rfcomm_channel {} is outside 1..=30",
            self.rfcomm_channel
         )));
      }
      Ok(())
   }

   pub const fn retry_delay(&self) -> Duration {
      Duration::from_millis(self.retry_delay_ms)
   }

   pub const fn poll_interval(&self) -> Duration {
      Duration::from_secs(self.poll_interval)
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }

   pub const fn scan_timeout(&self) -> Duration {
      Duration::from_secs(self.scan_timeout_sec)
   }

   /// Bound for the discovery + pairing pass: a full scan, then as long as
   /// a link attempt may take.
   pub const fn pair_timeout(&self) -> Duration {
      Duration::from_secs(self.scan_timeout_sec + self.connect_timeout_sec)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_empty_file_uses_defaults() {
      let config: Config = toml::from_str("").unwrap();
      assert_eq!(config.service_uuids, vec![SPP_UUID, THERMAL_PRINTER_UUID]);
      assert_eq!(config.rfcomm_channel, 1);
      assert_eq!(config.retry_delay(), Duration::from_millis(2500));
      assert_eq!(config.poll_interval(), Duration::from_secs(30));
      assert_eq!(config.reconnect_fallback, FallbackPolicy::PromptUser);
   }

   #[test]
   fn test_fallback_policy_parses_kebab_case() {
      let config: Config = toml::from_str(
         r#"
         adapter = "hci1"
         reconnect_fallback = "automatic"
         name_patterns = ["TM-", "printer"]
         "#,
      )
      .unwrap();
      assert_eq!(config.adapter.as_deref(), Some("hci1"));
      assert_eq!(config.reconnect_fallback, FallbackPolicy::Automatic);
      assert_eq!(config.name_patterns.len(), 2);
   }

   #[test]
   fn test_defaults_are_valid() {
      assert!(Config::default().validate().is_ok());
   }

   #[test]
   fn test_zero_timers_rejected() {
      for file in [
         "poll_interval = 0",
         "connect_timeout_sec = 0",
         "scan_timeout_sec = 0",
         "rfcomm_channel = 0",
         "rfcomm_channel = 31",
      ] {
         let config: Config = toml::from_str(file).unwrap();
         assert!(
            matches!(config.validate(), Err(ServiceError::InvalidConfig(_))),
            "{file} accepted"
         );
      }
   }

   #[test]
   fn test_pairing_outlasts_scan() {
      let config = Config::default();
      assert!(config.pair_timeout() > config.scan_timeout());
      assert!(config.pair_timeout() > config.connect_timeout());
   }

   #[test]
   fn test_load_creates_default_file() {
      let dir = tempfile::TempDir::new().unwrap();
      unsafe {
         env::set_var("POSLINK_HOME", dir.path());
      }
      let config = Config::load().unwrap();
      assert_eq!(config.poll_interval, 30);
      assert!(dir.path().join("poslinkd").join("config.toml").exists());
   }
}
