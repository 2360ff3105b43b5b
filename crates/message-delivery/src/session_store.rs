use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::types::{DeviceAddress, DEFAULT_DEVICE_ID};
use crate::{Error, Result};

/// The engine's view of the session store: presence only, never contents.
pub trait SessionStore: Send + Sync {
    fn contains_session(&self, address: &DeviceAddress) -> Result<bool>;

    /// Device ids other than the default device that have an active session.
    fn sub_device_sessions(&self, name: &str) -> Result<Vec<u32>>;

    /// Every device of the named recipients that has an active session.
    fn active_session_devices(&self, names: &[String]) -> Result<HashSet<DeviceAddress>>;

    fn archive_session(&self, address: &DeviceAddress) -> Result<()>;

    /// Whether the local account has linked devices.
    fn is_multi_device(&self) -> Result<bool>;
}

/// Opaque session state as the cipher hands it over.
pub type SessionRecord = Vec<u8>;

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<DeviceAddress, SessionRecord>>,
    archived: Mutex<HashMap<DeviceAddress, Vec<SessionRecord>>>,
    multi_device: AtomicBool,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> Result<MutexGuard<'_, HashMap<DeviceAddress, SessionRecord>>> {
        self.sessions
            .lock()
            .map_err(|_| Error::Storage("session store lock poisoned".to_string()))
    }

    pub fn store_session(&self, address: DeviceAddress, record: SessionRecord) -> Result<()> {
        self.sessions()?.insert(address, record);
        Ok(())
    }

    pub fn load_session(&self, address: &DeviceAddress) -> Result<Option<SessionRecord>> {
        Ok(self.sessions()?.get(address).cloned())
    }

    /// Number of sessions archived for an address so far.
    pub fn archived_count(&self, address: &DeviceAddress) -> Result<usize> {
        let archived = self
            .archived
            .lock()
            .map_err(|_| Error::Storage("session store lock poisoned".to_string()))?;
        Ok(archived.get(address).map(Vec::len).unwrap_or(0))
    }

    pub fn set_multi_device(&self, multi_device: bool) {
        self.multi_device.store(multi_device, Ordering::SeqCst);
    }
}

impl SessionStore for InMemorySessionStore {
    fn contains_session(&self, address: &DeviceAddress) -> Result<bool> {
        Ok(self.sessions()?.contains_key(address))
    }

    fn sub_device_sessions(&self, name: &str) -> Result<Vec<u32>> {
        let mut devices: Vec<u32> = self
            .sessions()?
            .keys()
            .filter(|a| a.name == name && a.device_id != DEFAULT_DEVICE_ID)
            .map(|a| a.device_id)
            .collect();
        devices.sort_unstable();
        Ok(devices)
    }

    fn active_session_devices(&self, names: &[String]) -> Result<HashSet<DeviceAddress>> {
        let names: HashSet<&str> = names.iter().map(String::as_str).collect();
        Ok(self
            .sessions()?
            .keys()
            .filter(|a| names.contains(a.name.as_str()))
            .cloned()
            .collect())
    }

    fn archive_session(&self, address: &DeviceAddress) -> Result<()> {
        let removed = self.sessions()?.remove(address);
        if let Some(record) = removed {
            self.archived
                .lock()
                .map_err(|_| Error::Storage("session store lock poisoned".to_string()))?
                .entry(address.clone())
                .or_default()
                .push(record);
        }
        Ok(())
    }

    fn is_multi_device(&self) -> Result<bool> {
        Ok(self.multi_device.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_devices_exclude_default() {
        let store = InMemorySessionStore::new();
        store.store_session(DeviceAddress::new("a", 1), vec![1]).unwrap();
        store.store_session(DeviceAddress::new("a", 3), vec![3]).unwrap();
        store.store_session(DeviceAddress::new("a", 2), vec![2]).unwrap();
        store.store_session(DeviceAddress::new("b", 2), vec![2]).unwrap();

        assert_eq!(store.sub_device_sessions("a").unwrap(), vec![2, 3]);
    }

    #[test]
    fn archive_removes_active_session() {
        let store = InMemorySessionStore::new();
        let address = DeviceAddress::new("a", 2);
        store.store_session(address.clone(), vec![2]).unwrap();

        store.archive_session(&address).unwrap();
        assert!(!store.contains_session(&address).unwrap());
        assert_eq!(store.archived_count(&address).unwrap(), 1);

        // Archiving a missing session is a no-op.
        store.archive_session(&address).unwrap();
        assert_eq!(store.archived_count(&address).unwrap(), 1);
    }

    #[test]
    fn active_devices_filtered_by_name() {
        let store = InMemorySessionStore::new();
        store.store_session(DeviceAddress::new("a", 1), vec![]).unwrap();
        store.store_session(DeviceAddress::new("b", 1), vec![]).unwrap();
        store.store_session(DeviceAddress::new("c", 4), vec![]).unwrap();

        let active = store
            .active_session_devices(&["a".to_string(), "c".to_string()])
            .unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&DeviceAddress::new("c", 4)));
    }
}
