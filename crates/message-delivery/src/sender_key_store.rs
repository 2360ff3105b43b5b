use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::storage::StorageAdapter;
use crate::types::{DeviceAddress, DistributionId};
use crate::{Error, Result};

const SHARED_WITH_PREFIX: &str = "sender-key/shared-with/";

/// Tracks which devices already hold the current sender key of each
/// distribution. Updates are unions and removals applied atomically.
pub trait SenderKeyStore: Send + Sync {
    fn shared_with(&self, distribution_id: DistributionId) -> Result<HashSet<DeviceAddress>>;

    fn mark_shared_with(
        &self,
        distribution_id: DistributionId,
        addresses: &[DeviceAddress],
    ) -> Result<()>;

    /// Forget the given devices for every distribution.
    fn clear_shared_with(&self, addresses: &[DeviceAddress]) -> Result<()>;
}

#[derive(Default)]
pub struct InMemorySenderKeyStore {
    shared: Mutex<HashMap<DistributionId, HashSet<DeviceAddress>>>,
}

impl InMemorySenderKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn shared(&self) -> Result<MutexGuard<'_, HashMap<DistributionId, HashSet<DeviceAddress>>>> {
        self.shared
            .lock()
            .map_err(|_| Error::Storage("sender key store lock poisoned".to_string()))
    }
}

impl SenderKeyStore for InMemorySenderKeyStore {
    fn shared_with(&self, distribution_id: DistributionId) -> Result<HashSet<DeviceAddress>> {
        Ok(self
            .shared()?
            .get(&distribution_id)
            .cloned()
            .unwrap_or_default())
    }

    fn mark_shared_with(
        &self,
        distribution_id: DistributionId,
        addresses: &[DeviceAddress],
    ) -> Result<()> {
        self.shared()?
            .entry(distribution_id)
            .or_default()
            .extend(addresses.iter().cloned());
        Ok(())
    }

    fn clear_shared_with(&self, addresses: &[DeviceAddress]) -> Result<()> {
        let mut shared = self.shared()?;
        for devices in shared.values_mut() {
            for address in addresses {
                devices.remove(address);
            }
        }
        Ok(())
    }
}

/// Shared-with sets persisted through a [`StorageAdapter`], one JSON list per
/// distribution id.
pub struct StoredSenderKeyStore {
    storage: Arc<dyn StorageAdapter>,
    // Serializes read-modify-write cycles on the adapter.
    write_lock: Mutex<()>,
}

impl StoredSenderKeyStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    fn key(distribution_id: DistributionId) -> String {
        format!("{SHARED_WITH_PREFIX}{distribution_id}")
    }

    fn load(&self, key: &str) -> Result<HashSet<DeviceAddress>> {
        match self.storage.get(key)? {
            Some(json) => Ok(serde_json::from_str::<Vec<DeviceAddress>>(&json)?
                .into_iter()
                .collect()),
            None => Ok(HashSet::new()),
        }
    }

    fn store(&self, key: &str, devices: &HashSet<DeviceAddress>) -> Result<()> {
        if devices.is_empty() {
            return self.storage.del(key);
        }
        let mut sorted: Vec<&DeviceAddress> = devices.iter().collect();
        sorted.sort();
        self.storage.put(key, serde_json::to_string(&sorted)?)
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Storage("sender key store lock poisoned".to_string()))
    }
}

impl SenderKeyStore for StoredSenderKeyStore {
    fn shared_with(&self, distribution_id: DistributionId) -> Result<HashSet<DeviceAddress>> {
        self.load(&Self::key(distribution_id))
    }

    fn mark_shared_with(
        &self,
        distribution_id: DistributionId,
        addresses: &[DeviceAddress],
    ) -> Result<()> {
        let _guard = self.guard()?;
        let key = Self::key(distribution_id);
        let mut devices = self.load(&key)?;
        devices.extend(addresses.iter().cloned());
        self.store(&key, &devices)
    }

    fn clear_shared_with(&self, addresses: &[DeviceAddress]) -> Result<()> {
        let _guard = self.guard()?;
        for key in self.storage.list(SHARED_WITH_PREFIX)? {
            let mut devices = self.load(&key)?;
            let before = devices.len();
            for address in addresses {
                devices.remove(address);
            }
            if devices.len() != before {
                self.store(&key, &devices)?;
            }
        }
        Ok(())
    }
}
