use std::sync::Arc;

use tracing::debug;

use crate::access::SealedSenderAccess;
use crate::address_book::AddressBook;
use crate::cancel::CancellationSignal;
use crate::cipher::SessionCipher;
use crate::content::EnvelopeContent;
use crate::handshake::Handshake;
use crate::lock::SessionLocks;
use crate::types::{
    DeviceAddress, DistributionId, OutgoingPushMessage, OutgoingPushMessageList,
    RecipientIdentity, DEFAULT_DEVICE_ID,
};
use crate::{Error, Result};

/// Turns one logical message into per-device envelopes, or into a single
/// sender-key ciphertext for a group.
#[derive(Clone)]
pub struct EnvelopeEncryptor {
    address_book: AddressBook,
    cipher: Arc<dyn SessionCipher>,
    handshake: Handshake,
    locks: SessionLocks,
    max_envelope_size: usize,
}

impl EnvelopeEncryptor {
    pub fn new(
        address_book: AddressBook,
        cipher: Arc<dyn SessionCipher>,
        handshake: Handshake,
        locks: SessionLocks,
        max_envelope_size: usize,
    ) -> Self {
        Self {
            address_book,
            cipher,
            handshake,
            locks,
            max_envelope_size,
        }
    }

    pub fn enforce_size(&self, content: &EnvelopeContent) -> Result<()> {
        if self.max_envelope_size == 0 {
            return Ok(());
        }
        let size = content.size()?;
        if size > self.max_envelope_size {
            return Err(Error::ContentTooLarge {
                size,
                max: self.max_envelope_size,
            });
        }
        Ok(())
    }

    /// Encrypt for one device, bootstrapping a session first if there is none.
    pub async fn encrypt_for_device(
        &self,
        recipient: &RecipientIdentity,
        device_id: u32,
        access: &SealedSenderAccess,
        content: &EnvelopeContent,
        story: bool,
        cancel: &CancellationSignal,
    ) -> Result<OutgoingPushMessage> {
        let address = recipient.device(device_id);
        let _guard = self.locks.lock(&address).await?;

        if !self.address_book.has_active_session(&address)? {
            self.handshake
                .bootstrap(recipient, device_id, access, story, cancel)
                .await?;
        }

        self.cipher.encrypt(&address, access, content)
    }

    /// One envelope per destination device of `recipient`. Sub-devices
    /// without a session are left for the server to report as missing.
    #[allow(clippy::too_many_arguments)]
    pub async fn encrypt_for_recipient(
        &self,
        recipient: &RecipientIdentity,
        access: &SealedSenderAccess,
        timestamp: u64,
        content: &EnvelopeContent,
        online: bool,
        urgent: bool,
        story: bool,
        cancel: &CancellationSignal,
    ) -> Result<OutgoingPushMessageList> {
        self.enforce_size(content)?;

        let mut messages = Vec::new();
        for device_id in self.address_book.devices_for(recipient)? {
            let address = recipient.device(device_id);
            if device_id != DEFAULT_DEVICE_ID && !self.address_book.has_active_session(&address)? {
                continue;
            }
            messages.push(
                self.encrypt_for_device(recipient, device_id, access, content, story, cancel)
                    .await?,
            );
        }

        debug!(timestamp, recipient = %recipient, devices = messages.len(), "encrypted envelopes");

        Ok(OutgoingPushMessageList {
            destination: recipient.identifier(),
            timestamp,
            messages,
            online,
            urgent,
        })
    }

    /// A single ciphertext for every destination. Fan-out must have handed
    /// the sender key to all of them already.
    pub fn encrypt_for_group(
        &self,
        distribution_id: DistributionId,
        destinations: &[DeviceAddress],
        access: &SealedSenderAccess,
        content: &EnvelopeContent,
    ) -> Result<Vec<u8>> {
        self.enforce_size(content)?;
        let certificate = access.certificate().ok_or_else(|| {
            Error::InvalidArgument("sender-key send requires a sender certificate".to_string())
        })?;
        self.cipher
            .encrypt_for_group(distribution_id, destinations, certificate, content)
    }
}
