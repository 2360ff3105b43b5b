use std::sync::Arc;

use tracing::debug;

use crate::access::SealedSenderAccess;
use crate::cancel::CancellationSignal;
use crate::cipher::SessionCipher;
use crate::error::TransportError;
use crate::events::SecurityEventListener;
use crate::transport::TransportSelector;
use crate::types::{PreKeyBundle, RecipientIdentity};
use crate::{Error, Result};

/// Builds sessions for devices that have none: fetch prekey bundles, hand
/// them to the cipher, tell the security listener.
#[derive(Clone)]
pub struct Handshake {
    transport: TransportSelector,
    cipher: Arc<dyn SessionCipher>,
    security: Option<Arc<dyn SecurityEventListener>>,
}

impl Handshake {
    pub fn new(
        transport: TransportSelector,
        cipher: Arc<dyn SessionCipher>,
        security: Option<Arc<dyn SecurityEventListener>>,
    ) -> Self {
        Self {
            transport,
            cipher,
            security,
        }
    }

    pub async fn bootstrap(
        &self,
        recipient: &RecipientIdentity,
        device_id: u32,
        access: &SealedSenderAccess,
        story: bool,
        cancel: &CancellationSignal,
    ) -> Result<()> {
        let bundles = self
            .fetch_pre_keys(recipient, device_id, access, story, cancel)
            .await?;

        for bundle in &bundles {
            let address = recipient.device(bundle.device_id);
            debug!(address = %address, "initializing prekey session");
            self.cipher
                .process_pre_key_bundle(&address, bundle)
                .map_err(|e| match e {
                    Error::InvalidKey(_) => Error::InvalidPreKey(address.clone()),
                    other => other,
                })?;
        }

        if bundles.is_empty() {
            debug!(recipient = %recipient, device_id, "no prekey bundles returned");
            return Ok(());
        }
        if let Some(listener) = &self.security {
            listener.on_security_event(recipient);
        }
        Ok(())
    }

    async fn fetch_pre_keys(
        &self,
        recipient: &RecipientIdentity,
        device_id: u32,
        access: &SealedSenderAccess,
        story: bool,
        cancel: &CancellationSignal,
    ) -> Result<Vec<PreKeyBundle>> {
        // Access that is only unrestricted because this is a story will be
        // refused for prekeys.
        let access = if story && access.is_unrestricted_for_story() {
            &SealedSenderAccess::None
        } else {
            access
        };

        match self
            .transport
            .get_pre_keys(recipient, access, device_id, cancel)
            .await
        {
            Err(Error::Transport(TransportError::AuthorizationFailed)) if story => {
                debug!(
                    recipient = %recipient,
                    device_id,
                    "401 fetching prekeys for story, retrying unsealed"
                );
                self.transport
                    .get_pre_keys(recipient, &SealedSenderAccess::None, device_id, cancel)
                    .await
            }
            other => other,
        }
    }
}
