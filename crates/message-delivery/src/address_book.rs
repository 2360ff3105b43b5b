use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::config::LocalAccount;
use crate::session_store::SessionStore;
use crate::types::{DeviceAddress, RecipientIdentity, DEFAULT_DEVICE_ID};
use crate::Result;

/// Devices a sender-key message goes to, as seen at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupTargetInfo {
    /// Every device with an active session plus each recipient's default device.
    pub destinations: Vec<DeviceAddress>,
    /// Destination device ids per recipient, in recipient order.
    pub devices: Vec<(RecipientIdentity, Vec<u32>)>,
    /// Destinations that had an active session when this was built.
    pub sessions: HashSet<DeviceAddress>,
}

impl GroupTargetInfo {
    pub fn destinations_of(&self, recipient: &RecipientIdentity) -> Vec<DeviceAddress> {
        let name = recipient.identifier();
        self.destinations
            .iter()
            .filter(|d| d.name == name)
            .cloned()
            .collect()
    }
}

/// Resolves recipients to the devices a message should be encrypted for.
#[derive(Clone)]
pub struct AddressBook {
    sessions: Arc<dyn SessionStore>,
    local: LocalAccount,
}

impl AddressBook {
    pub fn new(sessions: Arc<dyn SessionStore>, local: LocalAccount) -> Self {
        Self { sessions, local }
    }

    pub fn local(&self) -> &LocalAccount {
        &self.local
    }

    pub fn is_local(&self, recipient: &RecipientIdentity) -> bool {
        recipient.service_id() == self.local.service_id
    }

    /// The default device and every sub-device with a session. Sending to
    /// ourselves skips this device.
    pub fn devices_for(&self, recipient: &RecipientIdentity) -> Result<Vec<u32>> {
        let mut devices = vec![DEFAULT_DEVICE_ID];
        devices.extend(self.sessions.sub_device_sessions(&recipient.identifier())?);

        if self.is_local(recipient) {
            devices.retain(|d| *d != self.local.device_id);
        }
        Ok(devices)
    }

    pub fn has_active_session(&self, address: &DeviceAddress) -> Result<bool> {
        self.sessions.contains_session(address)
    }

    pub fn group_target_info(&self, recipients: &[RecipientIdentity]) -> Result<GroupTargetInfo> {
        let names: Vec<String> = recipients.iter().map(|r| r.identifier()).collect();
        let sessions = self.sessions.active_session_devices(&names)?;

        let mut destinations: BTreeSet<DeviceAddress> = sessions.iter().cloned().collect();
        destinations.extend(recipients.iter().map(|r| r.device(DEFAULT_DEVICE_ID)));

        let mut devices = Vec::with_capacity(recipients.len());
        let mut seen = HashSet::new();
        for recipient in recipients {
            if !seen.insert(recipient.service_id()) {
                continue;
            }
            let name = recipient.identifier();
            let ids: Vec<u32> = destinations
                .iter()
                .filter(|d| d.name == name)
                .map(|d| d.device_id)
                .collect();
            devices.push((recipient.clone(), ids));
        }

        Ok(GroupTargetInfo {
            destinations: destinations.into_iter().collect(),
            devices,
            sessions,
        })
    }
}
