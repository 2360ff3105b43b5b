use std::sync::Arc;

use tracing::warn;

use crate::access::SealedSenderAccess;
use crate::cancel::CancellationSignal;
use crate::handshake::Handshake;
use crate::lock::SessionLocks;
use crate::retry::result_for_error;
use crate::sender_key_store::SenderKeyStore;
use crate::session_store::SessionStore;
use crate::types::{
    DeviceAddress, GroupMismatchedDevices, GroupStaleDevices, MismatchedDevices,
    RecipientIdentity, SendMessageResult, ServiceId, StaleDevices,
};
use crate::Result;

/// Brings local sessions back in line with the server's device list.
#[derive(Clone)]
pub struct DeviceReconciler {
    sessions: Arc<dyn SessionStore>,
    sender_keys: Arc<dyn SenderKeyStore>,
    handshake: Handshake,
    locks: SessionLocks,
}

impl DeviceReconciler {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        sender_keys: Arc<dyn SenderKeyStore>,
        handshake: Handshake,
        locks: SessionLocks,
    ) -> Self {
        Self {
            sessions,
            sender_keys,
            handshake,
            locks,
        }
    }

    /// Archive extra devices, then build sessions for missing ones.
    pub async fn handle_mismatched(
        &self,
        recipient: &RecipientIdentity,
        mismatched: &MismatchedDevices,
        cancel: &CancellationSignal,
    ) -> Result<()> {
        warn!(
            recipient = %recipient,
            extra = ?mismatched.extra_devices,
            missing = ?mismatched.missing_devices,
            "handling mismatched devices"
        );
        self.archive(recipient, &mismatched.extra_devices)?;

        for device_id in &mismatched.missing_devices {
            let _guard = self.locks.lock(&recipient.device(*device_id)).await?;
            self.handshake
                .bootstrap(recipient, *device_id, &SealedSenderAccess::None, false, cancel)
                .await?;
        }
        Ok(())
    }

    pub fn handle_stale(&self, recipient: &RecipientIdentity, stale: &StaleDevices) -> Result<()> {
        warn!(recipient = %recipient, stale = ?stale.stale_devices, "handling stale devices");
        self.archive(recipient, &stale.stale_devices)
    }

    /// Repair every listed member. A member whose repair ends in a failure
    /// with a result of its own, such as an invalid prekey bundle, is
    /// reported back instead of failing the whole group.
    pub async fn handle_group_mismatched(
        &self,
        entries: &[GroupMismatchedDevices],
        recipients: &[RecipientIdentity],
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        let mut failed = Vec::new();
        for entry in entries {
            let recipient = resolve(recipients, entry.service_id);
            if let Err(e) = self.handle_mismatched(&recipient, &entry.devices, cancel).await {
                failed.push(result_for_error(&recipient, e)?);
            }
        }
        Ok(failed)
    }

    pub fn handle_group_stale(
        &self,
        entries: &[GroupStaleDevices],
        recipients: &[RecipientIdentity],
    ) -> Result<()> {
        for entry in entries {
            let recipient = resolve(recipients, entry.service_id);
            self.handle_stale(&recipient, &entry.devices)?;
        }
        Ok(())
    }

    /// Archive the sessions of `devices` under the service id and the
    /// phone-number alias, and forget that they hold any sender key.
    pub fn archive(&self, recipient: &RecipientIdentity, devices: &[u32]) -> Result<()> {
        if devices.is_empty() {
            return Ok(());
        }

        let mut addresses: Vec<DeviceAddress> = Vec::with_capacity(devices.len() * 2);
        for device_id in devices {
            addresses.push(recipient.device(*device_id));
            if let Some(alias) = recipient.alias_device(*device_id) {
                addresses.push(alias);
            }
        }

        for address in &addresses {
            self.sessions.archive_session(address)?;
        }
        self.sender_keys.clear_shared_with(&addresses)
    }
}

// Prefer the caller's identity so the phone-number alias is kept.
fn resolve(recipients: &[RecipientIdentity], service_id: ServiceId) -> RecipientIdentity {
    recipients
        .iter()
        .find(|r| r.service_id() == service_id)
        .cloned()
        .unwrap_or_else(|| RecipientIdentity::new(service_id))
}
