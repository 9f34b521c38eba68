//! Durable storage for the last-known device and link status.
//!
//! The connection core only needs a tiny key space, so storage is a
//! string key-value trait with an LMDB (heed) implementation for the
//! daemon and an in-memory one for tests and degraded operation.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use heed::{Database, Env, EnvOpenOptions, types::Str};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
   error::{Result, ServiceError},
   session::{ConnectionStatus, DeviceIdentity, PersistedRecord},
};

const DEVICE_KEY: &str = "link.device";
const STATUS_KEY: &str = "link.status";

/// Minimal key-value storage.
pub trait KvStore: Send + Sync {
   fn get(&self, key: &str) -> Result<Option<String>>;
   fn set(&self, key: &str, value: &str) -> Result<()>;
   fn delete(&self, key: &str) -> Result<()>;
}

/// Database layout for the link store
#[derive(Debug)]
struct Db {
   env: Env,
   /// key -> value
   entries: Database<Str, Str>,
}

/// LMDB-backed store.
#[derive(Clone, Debug)]
pub struct HeedStore {
   db: Arc<Db>,
}

impl HeedStore {
   /// Opens the store at the default location.
   pub fn open_default() -> Result<Self> {
      Self::open(Self::db_path()?)
   }

   /// Open or create the store at `path`.
   pub fn open(path: PathBuf) -> Result<Self> {
      std::fs::create_dir_all(&path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(1024 * 1024)
            .max_dbs(1)
            .open(&path)?
      };

      let mut wtxn = env.write_txn()?;
      let entries = env.create_database(&mut wtxn, Some("link"))?;
      wtxn.commit()?;

      Ok(Self {
         db: Arc::new(Db { env, entries }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("POSLINK_STORE_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/poslinkd/link.db
      let base = dirs::data_local_dir().ok_or(ServiceError::DataDirNotFound)?;
      Ok(base.join("poslinkd").join("link.db"))
   }
}

impl KvStore for HeedStore {
   fn get(&self, key: &str) -> Result<Option<String>> {
      let rtxn = self.db.env.read_txn()?;
      Ok(self.db.entries.get(&rtxn, key)?.map(str::to_owned))
   }

   fn set(&self, key: &str, value: &str) -> Result<()> {
      let mut wtxn = self.db.env.write_txn()?;
      self.db.entries.put(&mut wtxn, key, value)?;
      wtxn.commit()?;
      Ok(())
   }

   fn delete(&self, key: &str) -> Result<()> {
      let mut wtxn = self.db.env.write_txn()?;
      self.db.entries.delete(&mut wtxn, key)?;
      wtxn.commit()?;
      Ok(())
   }
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct MemoryStore {
   entries: Mutex<HashMap<String, String>>,
}

impl KvStore for MemoryStore {
   fn get(&self, key: &str) -> Result<Option<String>> {
      Ok(self.entries.lock().get(key).cloned())
   }

   fn set(&self, key: &str, value: &str) -> Result<()> {
      self.entries.lock().insert(key.to_owned(), value.to_owned());
      Ok(())
   }

   fn delete(&self, key: &str) -> Result<()> {
      self.entries.lock().remove(key);
      Ok(())
   }
}

impl<T: KvStore + ?Sized> KvStore for Arc<T> {
   fn get(&self, key: &str) -> Result<Option<String>> {
      (**self).get(key)
   }

   fn set(&self, key: &str, value: &str) -> Result<()> {
      (**self).set(key, value)
   }

   fn delete(&self, key: &str) -> Result<()> {
      (**self).delete(key)
   }
}

/// Maps `PersistedRecord` onto a `KvStore`.
///
/// Failures are logged and swallowed: the in-memory session stays
/// authoritative for the lifetime of the process.
pub struct Persistence {
   store: Box<dyn KvStore>,
}

impl Persistence {
   pub fn new(store: impl KvStore + 'static) -> Self {
      Self {
         store: Box::new(store),
      }
   }

   pub fn save(&self, record: &PersistedRecord) {
      if let Err(e) = self.try_save(record) {
         warn!("Failed to persist link record: {e}");
      } else {
         debug!("Persisted link record: {record:?}");
      }
   }

   pub fn load(&self) -> Option<PersistedRecord> {
      match self.try_load() {
         Ok(record) => record,
         Err(e) => {
            warn!("Failed to load link record: {e}");
            None
         },
      }
   }

   pub fn clear(&self) {
      let result = self
         .store
         .delete(DEVICE_KEY)
         .and_then(|()| self.store.delete(STATUS_KEY));
      if let Err(e) = result {
         warn!("Failed to clear link record: {e}");
      }
   }

   fn try_save(&self, record: &PersistedRecord) -> Result<()> {
      match &record.device {
         Some(device) => self
            .store
            .set(DEVICE_KEY, &serde_json::to_string(device)?)?,
         None => self.store.delete(DEVICE_KEY)?,
      }
      let status: &'static str = record.status.into();
      self.store.set(STATUS_KEY, status)
   }

   fn try_load(&self) -> Result<Option<PersistedRecord>> {
      let device = self.store.get(DEVICE_KEY)?;
      let status = self.store.get(STATUS_KEY)?;
      if device.is_none() && status.is_none() {
         return Ok(None);
      }

      let device = device
         .map(|json| serde_json::from_str::<DeviceIdentity>(&json))
         .transpose()?;
      let status = status
         .and_then(|s| s.parse::<ConnectionStatus>().ok())
         .unwrap_or_default();
      Ok(Some(PersistedRecord { device, status }))
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;

   struct BrokenStore;

   impl KvStore for BrokenStore {
      fn get(&self, _key: &str) -> Result<Option<String>> {
         Err(ServiceError::DataDirNotFound)
      }

      fn set(&self, _key: &str, _value: &str) -> Result<()> {
         Err(ServiceError::DataDirNotFound)
      }

      fn delete(&self, _key: &str) -> Result<()> {
         Err(ServiceError::DataDirNotFound)
      }
   }

   fn record() -> PersistedRecord {
      PersistedRecord {
         device: Some(DeviceIdentity::new("00:11:22:33:44:55", "TM-m30")),
         status: ConnectionStatus::Connected,
      }
   }

   #[test]
   fn test_heed_store_roundtrip() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let store = HeedStore::open(dir.path().join("link.db"))?;

      assert_eq!(store.get("missing")?, None);
      store.set("a", "1")?;
      assert_eq!(store.get("a")?.as_deref(), Some("1"));
      store.delete("a")?;
      assert_eq!(store.get("a")?, None);
      Ok(())
   }

   #[test]
   fn test_record_survives_reopen() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("link.db");

      Persistence::new(HeedStore::open(path.clone())?).save(&record());

      let reopened = Persistence::new(HeedStore::open(path)?);
      assert_eq!(reopened.load(), Some(record()));
      Ok(())
   }

   #[test]
   fn test_clear_removes_record() {
      let persistence = Persistence::new(MemoryStore::default());
      persistence.save(&record());
      persistence.clear();
      assert_eq!(persistence.load(), None);
   }

   #[test]
   fn test_record_without_device() {
      let store = Arc::new(MemoryStore::default());
      let persistence = Persistence::new(store.clone());
      persistence.save(&record());
      persistence.save(&PersistedRecord::default());

      assert_eq!(store.get(DEVICE_KEY).unwrap(), None);
      assert_eq!(store.get(STATUS_KEY).unwrap().as_deref(), Some("Disconnected"));
      assert_eq!(persistence.load(), Some(PersistedRecord::default()));
   }

   #[test]
   fn test_store_failures_are_not_fatal() {
      let persistence = Persistence::new(BrokenStore);
      persistence.save(&record());
      persistence.clear();
      assert_eq!(persistence.load(), None);
   }
}
