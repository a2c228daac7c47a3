//! Fleet discovery registry.
//!
//! Workers announce themselves by appending their identity under a shared
//! role key; the dispatcher lists that key on a cadence to find new peers.
//! Identities parked in the inactive set are skipped by the dispatcher and
//! tell a running worker to drain and exit.

pub mod sled_store;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;

pub trait Registry: Send {
    fn list_identities(&self, role: &str) -> Result<Vec<String>, RegistryError>;
    fn append_identity(&self, role: &str, identity: &str) -> Result<(), RegistryError>;
    fn remove_identity(&self, role: &str, identity: &str) -> Result<(), RegistryError>;
    fn mark_inactive(&self, role: &str, identity: &str) -> Result<(), RegistryError>;
    fn clear_inactive(&self, role: &str, identity: &str) -> Result<(), RegistryError>;
    fn is_inactive(&self, role: &str, identity: &str) -> Result<bool, RegistryError>;
}

impl<R: Registry + Sync + ?Sized> Registry for std::sync::Arc<R> {
    fn list_identities(&self, role: &str) -> Result<Vec<String>, RegistryError> {
        (**self).list_identities(role)
    }

    fn append_identity(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
        (**self).append_identity(role, identity)
    }

    fn remove_identity(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
        (**self).remove_identity(role, identity)
    }

    fn mark_inactive(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
        (**self).mark_inactive(role, identity)
    }

    fn clear_inactive(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
        (**self).clear_inactive(role, identity)
    }

    fn is_inactive(&self, role: &str, identity: &str) -> Result<bool, RegistryError> {
        (**self).is_inactive(role, identity)
    }
}

#[derive(Debug)]
pub enum RegistryError {
    Sled(sled::Error),
    Serialize(serde_json::Error),
    Deserialize(serde_json::Error),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sled(source) => write!(f, "registry store error: {source}"),
            Self::Serialize(source) => write!(f, "failed to serialize registry entry: {source}"),
            Self::Deserialize(source) => {
                write!(f, "failed to deserialize registry entry: {source}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// `"<role_key>:<host>:<port>"`, e.g. `pulse:workers:10.0.0.5:5555`.
pub fn compose_identity(role_key: &str, host: &str, port: u16) -> String {
    format!("{role_key}:{host}:{port}")
}

/// The dialable `host:port` tail of an identity, or `None` when the
/// identity does not belong to the given role.
pub fn dial_address<'a>(role_key: &str, identity: &'a str) -> Option<&'a str> {
    identity
        .strip_prefix(role_key)
        .and_then(|rest| rest.strip_prefix(':'))
        .filter(|address| !address.is_empty())
}

/// Ephemeral registry for tests and single-process runs.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, Vec<String>>,
    inactive: HashMap<String, BTreeSet<String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().expect("memory registry mutex poisoned");
        f(&mut state)
    }
}

impl Registry for MemoryRegistry {
    fn list_identities(&self, role: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self.with_state(|state| state.lists.get(role).cloned().unwrap_or_default()))
    }

    fn append_identity(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
        self.with_state(|state| {
            let list = state.lists.entry(role.to_owned()).or_default();
            if !list.iter().any(|entry| entry == identity) {
                list.push(identity.to_owned());
            }
        });
        Ok(())
    }

    fn remove_identity(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
        self.with_state(|state| {
            if let Some(list) = state.lists.get_mut(role) {
                list.retain(|entry| entry != identity);
            }
        });
        Ok(())
    }

    fn mark_inactive(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
        self.with_state(|state| {
            state
                .inactive
                .entry(role.to_owned())
                .or_default()
                .insert(identity.to_owned());
        });
        Ok(())
    }

    fn clear_inactive(&self, role: &str, identity: &str) -> Result<(), RegistryError> {
        self.with_state(|state| {
            if let Some(set) = state.inactive.get_mut(role) {
                set.remove(identity);
            }
        });
        Ok(())
    }

    fn is_inactive(&self, role: &str, identity: &str) -> Result<bool, RegistryError> {
        Ok(self.with_state(|state| {
            state
                .inactive
                .get(role)
                .map(|set| set.contains(identity))
                .unwrap_or(false)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::{compose_identity, dial_address, MemoryRegistry, Registry};

    const ROLE: &str = "pulse:workers";

    #[test]
    fn identity_composition_and_dial_address_round_trip() {
        let identity = compose_identity(ROLE, "10.0.0.5", 5555);
        assert_eq!(identity, "pulse:workers:10.0.0.5:5555");
        assert_eq!(dial_address(ROLE, &identity), Some("10.0.0.5:5555"));
    }

    #[test]
    fn dial_address_rejects_foreign_role() {
        assert_eq!(dial_address(ROLE, "pulse:builders:10.0.0.5:5555"), None);
        assert_eq!(dial_address(ROLE, "pulse:workers:"), None);
    }

    #[test]
    fn append_is_idempotent_per_identity() {
        let registry = MemoryRegistry::new();
        registry
            .append_identity(ROLE, "pulse:workers:a:1")
            .expect("append should succeed");
        registry
            .append_identity(ROLE, "pulse:workers:a:1")
            .expect("duplicate append should succeed");
        registry
            .append_identity(ROLE, "pulse:workers:b:2")
            .expect("append should succeed");

        let identities = registry
            .list_identities(ROLE)
            .expect("list should succeed");
        assert_eq!(
            identities,
            vec!["pulse:workers:a:1".to_owned(), "pulse:workers:b:2".to_owned()]
        );
    }

    #[test]
    fn remove_deletes_only_the_named_identity() {
        let registry = MemoryRegistry::new();
        registry
            .append_identity(ROLE, "pulse:workers:a:1")
            .expect("append should succeed");
        registry
            .append_identity(ROLE, "pulse:workers:b:2")
            .expect("append should succeed");
        registry
            .remove_identity(ROLE, "pulse:workers:a:1")
            .expect("remove should succeed");

        let identities = registry
            .list_identities(ROLE)
            .expect("list should succeed");
        assert_eq!(identities, vec!["pulse:workers:b:2".to_owned()]);
    }

    #[test]
    fn inactive_flag_sets_and_clears() {
        let registry = MemoryRegistry::new();
        let identity = "pulse:workers:a:1";

        assert!(!registry
            .is_inactive(ROLE, identity)
            .expect("check should succeed"));

        registry
            .mark_inactive(ROLE, identity)
            .expect("mark should succeed");
        assert!(registry
            .is_inactive(ROLE, identity)
            .expect("check should succeed"));

        registry
            .clear_inactive(ROLE, identity)
            .expect("clear should succeed");
        assert!(!registry
            .is_inactive(ROLE, identity)
            .expect("check should succeed"));
    }
}
