use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use super::{Registry, RegistryError};

const LIST_PREFIX: &str = "v1:list:";
const INACTIVE_PREFIX: &str = "v1:inactive:";

/// On-disk registry backed by sled. List and inactive-set values are stored
/// as JSON; read-modify-write cycles serialize through `guard` so concurrent
/// registrations from dispatcher and handler threads cannot lose entries.
pub struct SledRegistry {
    db: sled::Db,
    guard: Mutex<()>,
}

impl SledRegistry {
    pub fn open(data_path: &Path) -> Result<Self, RegistryError> {
        let db = sled::Config::new()
            .path(data_path)
            .open()
            .map_err(RegistryError::Sled)?;
        Ok(Self {
            db,
            guard: Mutex::new(()),
        })
    }

    fn read_list(&self, role: &str) -> Result<Vec<String>, RegistryError> {
        let key = format!("{LIST_PREFIX}{role}");
        match self.db.get(key.as_bytes()).map_err(RegistryError::Sled)? {
            Some(raw) => serde_json::from_slice(raw.as_ref()).map_err(RegistryError::Deserialize),
            None => Ok(Vec::new()),
        }
    }

    fn write_list(&self, role: &str, list: &[String]) -> Result<(), RegistryError> {
        let key = format!("{LIST_PREFIX}{role}");
        let value = serde_json::to_vec(list).map_err(RegistryError::Serialize)?;
        self.db
            .insert(key.as_bytes(), value)
            .map_err(RegistryError::Sled)?;
        self.db.flush().map_err(RegistryError::Sled)?;
        Ok(())
    }

    fn read_inactive(&self, role: &str) -> Result<BTreeSet<String>, RegistryError> {
        let key = format!("{INACTIVE_PREFIX}{role}");
        match self.db.get(key.as_bytes()).map_err(RegistryError::Sled)? {
            Some(raw) => serde_json::from_slice(raw.as_ref()).map_err(RegistryError::Deserialize),
            None => Ok(BTreeSet::new()),
        }
    }

    fn write_inactive(&self, role: &str, set: &BTreeSet<String>) -> Result<(), RegistryError> {
        let key = format!("{INACTIVE_PREFIX}{role}");
        let value = serde_json::to_vec(set).map_err(RegistryError::Serialize)?;
        self.db
            .insert(key.as_bytes(), value)
            .map_err(RegistryError::Sled)?;
        self.db.flush().map_err(RegistryError::Sled)?;
        Ok(())
    }
}

impl Registry for SledRegistry {
    fn list_identities(&self, role: &str) -> Result<Vec<String>, RegistryError> {
        let _guard = self.guard.lock().expect("sled registry mutex poisoned");
        self.read_list(role)
    }

    fn append_identity(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
        let _guard = self.guard.lock().expect("sled registry mutex poisoned");
        let mut list = self.read_list(role)?;
        if !list.iter().any(|entry| entry == identity) {
            list.push(identity.to_owned());
            self.write_list(role, &list)?;
        }
        Ok(())
    }

    fn remove_identity(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
        let _guard = self.guard.lock().expect("sled registry mutex poisoned");
        let mut list = self.read_list(role)?;
        let before = list.len();
        list.retain(|entry| entry != identity);
        if list.len() != before {
            self.write_list(role, &list)?;
        }
        Ok(())
    }

    fn mark_inactive(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
        let _guard = self.guard.lock().expect("sled registry mutex poisoned");
        let mut set = self.read_inactive(role)?;
        if set.insert(identity.to_owned()) {
            self.write_inactive(role, &set)?;
        }
        Ok(())
    }

    fn clear_inactive(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
        let _guard = self.guard.lock().expect("sled registry mutex poisoned");
        let mut set = self.read_inactive(role)?;
        if set.remove(identity) {
            self.write_inactive(role, &set)?;
        }
        Ok(())
    }

    fn is_inactive(&self, role: &str, identity: &str) -> Result<bool, RegistryError> {
        let _guard = self.guard.lock().expect("sled registry mutex poisoned");
        Ok(self.read_inactive(role)?.contains(identity))
    }
}
