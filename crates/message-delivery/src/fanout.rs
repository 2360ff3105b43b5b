use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::access::{GroupSendEndorsements, IndividualAccess, SealedSenderAccess};
use crate::address_book::{AddressBook, GroupTargetInfo};
use crate::cancel::CancellationSignal;
use crate::cipher::SessionCipher;
use crate::config::LocalAccount;
use crate::content::{Content, ContentHint, EnvelopeContent};
use crate::encryptor::EnvelopeEncryptor;
use crate::error::TransportError;
use crate::events::SendEvents;
use crate::reconciler::DeviceReconciler;
use crate::retry::{OutgoingMessage, RetryCoordinator};
use crate::sender_key_store::SenderKeyStore;
use crate::session_store::SessionStore;
use crate::transport::{GroupSendRequest, TransportSelector};
use crate::types::{
    DeviceAddress, DistributionId, GroupId, RecipientIdentity, SendGroupMessageResponse,
    SendMessageResult, SenderKeyDistributionMessage, ServiceId,
};
use crate::{Error, Result};

/// One sender-key send to a group or story audience.
#[derive(Debug, Clone)]
pub struct GroupMessage {
    pub distribution_id: DistributionId,
    pub recipients: Vec<RecipientIdentity>,
    /// Parallel to `recipients`.
    pub accesses: Vec<Option<IndividualAccess>>,
    pub endorsements: Option<GroupSendEndorsements>,
    pub timestamp: u64,
    pub content: Content,
    pub hint: ContentHint,
    pub group_id: Option<GroupId>,
    pub online: bool,
    pub urgent: bool,
    pub story: bool,
}

enum Distribution {
    NotNeeded(GroupTargetInfo),
    Shared(GroupTargetInfo),
    Failed(Vec<SendMessageResult>),
}

/// Sends one sender-key ciphertext to every member of a group, handing the
/// sender key to whoever lacks it first.
#[derive(Clone)]
pub struct GroupFanoutCoordinator {
    local: LocalAccount,
    retry_count: u32,
    address_book: AddressBook,
    sessions: Arc<dyn SessionStore>,
    sender_keys: Arc<dyn SenderKeyStore>,
    cipher: Arc<dyn SessionCipher>,
    encryptor: EnvelopeEncryptor,
    reconciler: DeviceReconciler,
    transport: TransportSelector,
    retry: RetryCoordinator,
}

impl GroupFanoutCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        address_book: AddressBook,
        sessions: Arc<dyn SessionStore>,
        sender_keys: Arc<dyn SenderKeyStore>,
        cipher: Arc<dyn SessionCipher>,
        encryptor: EnvelopeEncryptor,
        reconciler: DeviceReconciler,
        transport: TransportSelector,
        retry: RetryCoordinator,
    ) -> Self {
        Self {
            local: address_book.local().clone(),
            retry_count: retry.retry_count(),
            address_book,
            sessions,
            sender_keys,
            cipher,
            encryptor,
            reconciler,
            transport,
            retry,
        }
    }

    /// The local device's distribution message for `distribution_id`,
    /// creating the sender-key session if needed.
    pub fn distribution_message(
        &self,
        distribution_id: DistributionId,
    ) -> Result<SenderKeyDistributionMessage> {
        let sender = self.local.identity().device(self.local.device_id);
        self.cipher
            .get_or_create_distribution_message(&sender, distribution_id)
    }

    pub async fn send(
        &self,
        message: &GroupMessage,
        events: &dyn SendEvents,
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        if message.recipients.is_empty() {
            debug!(timestamp = message.timestamp, "no group recipients, nothing to send");
            return Ok(Vec::new());
        }
        if message.recipients.len() != message.accesses.len() {
            return Err(Error::InvalidArgument(format!(
                "{} recipients but {} access entries",
                message.recipients.len(),
                message.accesses.len()
            )));
        }

        let content = EnvelopeContent::encrypted(
            message.content.clone(),
            message.hint,
            message.group_id.clone(),
        );
        self.encryptor.enforce_size(&content)?;

        let mut access = SealedSenderAccess::for_group_send(
            message.endorsements.as_ref(),
            &message.accesses,
            message.story,
        )?;
        let mut members = message.clone();
        // Members a repair had to drop, with their results.
        let mut dropped: Vec<SendMessageResult> = Vec::new();

        for attempt in 0..self.retry_count {
            cancel.check()?;

            let target = match self.distribute_if_needed(&members, cancel).await {
                Ok(Distribution::NotNeeded(target)) => target,
                Ok(Distribution::Shared(target)) => {
                    events.on_sender_key_shared();
                    target
                }
                Ok(Distribution::Failed(results)) => return Ok(merged(dropped, results)),
                Err(Error::FanOut { results, errors }) => {
                    return Err(Error::FanOut {
                        results: merged(dropped, results),
                        errors,
                    })
                }
                Err(e) => return Err(e),
            };

            let ciphertext = self.encryptor.encrypt_for_group(
                members.distribution_id,
                &target.destinations,
                &access,
                &content,
            )?;
            if attempt == 0 {
                events.on_message_encrypted();
            }

            let request = GroupSendRequest {
                ciphertext,
                timestamp: members.timestamp,
                online: members.online,
                urgent: members.urgent,
                story: members.story,
            };

            match self
                .transport
                .send_group_message(&request, &access, cancel)
                .await
            {
                Ok(response) => {
                    info!(
                        timestamp = members.timestamp,
                        distribution_id = %members.distribution_id,
                        destinations = target.destinations.len(),
                        unsent = response.unsent_targets.len(),
                        "sender-key send complete"
                    );
                    let results = self.results_from_response(&target, response)?;
                    return Ok(merged(dropped, results));
                }
                Err(e) => {
                    let failed = self
                        .repair(e, &mut access, &members.recipients, cancel)
                        .await?;
                    if !failed.is_empty() {
                        members.retain_recipients(|r| !failed.iter().any(|f| &f.address == r));
                        dropped.extend(failed);
                        if members.recipients.is_empty() {
                            return Ok(dropped);
                        }
                        access = access_for_remaining(access, &members);
                    }
                }
            }
            warn!(timestamp = members.timestamp, attempt, "sender-key send attempt failed");
        }

        warn!(
            timestamp = members.timestamp,
            attempts = self.retry_count,
            "failed to resolve sender-key send"
        );
        Err(Error::RetriesExhausted {
            attempts: self.retry_count,
        })
    }

    /// Send the distribution message to `recipients` regardless of what the
    /// shared-with record says, and record every device that got it.
    #[allow(clippy::too_many_arguments)]
    pub async fn share_sender_key(
        &self,
        distribution_id: DistributionId,
        recipients: &[RecipientIdentity],
        accesses: Vec<Option<IndividualAccess>>,
        endorsements: Option<&GroupSendEndorsements>,
        group_id: Option<&GroupId>,
        timestamp: u64,
        urgent: bool,
        story: bool,
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        let (results, errors) = match self
            .send_distribution(
                distribution_id,
                recipients,
                accesses,
                endorsements,
                group_id,
                timestamp,
                urgent,
                story,
                cancel,
            )
            .await
        {
            Ok(results) => (results, Vec::new()),
            Err(Error::FanOut { results, errors }) => (results, errors),
            Err(e) => return Err(e),
        };

        let delivered: Vec<RecipientIdentity> = results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.address.clone())
            .collect();
        if !delivered.is_empty() {
            let target = self.address_book.group_target_info(&delivered)?;
            self.sender_keys
                .mark_shared_with(distribution_id, &target.destinations)?;
        }
        if errors.is_empty() {
            Ok(results)
        } else {
            Err(Error::FanOut { results, errors })
        }
    }

    async fn distribute_if_needed(
        &self,
        message: &GroupMessage,
        cancel: &CancellationSignal,
    ) -> Result<Distribution> {
        let target = self.address_book.group_target_info(&message.recipients)?;
        let shared = self.sender_keys.shared_with(message.distribution_id)?;

        let access_by_sid: HashMap<ServiceId, Option<IndividualAccess>> = message
            .recipients
            .iter()
            .map(RecipientIdentity::service_id)
            .zip(message.accesses.iter().cloned())
            .collect();

        let mut needs = Vec::new();
        let mut accesses = Vec::new();
        for (recipient, device_ids) in &target.devices {
            let missing = device_ids.iter().any(|id| {
                let address = recipient.device(*id);
                !shared.contains(&address) || !target.sessions.contains(&address)
            });
            if missing {
                needs.push(recipient.clone());
                accesses.push(access_by_sid.get(&recipient.service_id()).cloned().flatten());
            }
        }

        if needs.is_empty() {
            return Ok(Distribution::NotNeeded(target));
        }

        info!(
            timestamp = message.timestamp,
            distribution_id = %message.distribution_id,
            recipients = needs.len(),
            "distributing sender key"
        );
        let results = match self
            .send_distribution(
                message.distribution_id,
                &needs,
                accesses,
                message.endorsements.as_ref(),
                message.group_id.as_ref(),
                message.timestamp,
                message.urgent,
                message.story,
                cancel,
            )
            .await
        {
            Ok(results) => results,
            Err(Error::FanOut { results, errors }) => {
                warn!(
                    timestamp = message.timestamp,
                    failed = errors.len(),
                    "sender key distribution failed, not sending group message"
                );
                let others: Vec<RecipientIdentity> = message
                    .recipients
                    .iter()
                    .filter(|r| !errors.iter().any(|(failed, _)| failed == *r))
                    .cloned()
                    .collect();
                let failures = results.into_iter().filter(|r| !r.is_success()).collect();
                return Err(Error::FanOut {
                    results: with_untouched_recipients(failures, &others),
                    errors,
                });
            }
            Err(e) => return Err(e),
        };

        let failures: Vec<SendMessageResult> =
            results.into_iter().filter(|r| !r.is_success()).collect();
        if !failures.is_empty() {
            warn!(
                timestamp = message.timestamp,
                failed = failures.len(),
                "sender key distribution failed, not sending group message"
            );
            return Ok(Distribution::Failed(with_untouched_recipients(
                failures,
                &message.recipients,
            )));
        }

        // Distribution may have bootstrapped new sessions.
        let target = self.address_book.group_target_info(&message.recipients)?;
        let addresses: Vec<DeviceAddress> = needs
            .iter()
            .flat_map(|r| target.destinations_of(r))
            .collect();
        self.sender_keys
            .mark_shared_with(message.distribution_id, &addresses)?;
        Ok(Distribution::Shared(target))
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_distribution(
        &self,
        distribution_id: DistributionId,
        recipients: &[RecipientIdentity],
        accesses: Vec<Option<IndividualAccess>>,
        endorsements: Option<&GroupSendEndorsements>,
        group_id: Option<&GroupId>,
        timestamp: u64,
        urgent: bool,
        story: bool,
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        let distribution = self.distribution_message(distribution_id)?;
        let content = EnvelopeContent::encrypted(
            Content::sender_key_distribution(distribution),
            ContentHint::Implicit,
            group_id.cloned(),
        );

        let certificate = accesses
            .iter()
            .flatten()
            .map(|a| a.certificate.clone())
            .next();
        let tokens = endorsements.map(|e| e.for_individuals(recipients));
        let accesses =
            SealedSenderAccess::for_fan_out_group_send(tokens, certificate.as_ref(), accesses);

        let outgoing = OutgoingMessage::new(timestamp, content)
            .urgent(urgent)
            .story(story && group_id.is_none());
        self.retry
            .send_to_many(recipients, accesses, outgoing, None, cancel)
            .await
    }

    /// Repair after a failed group send. Members that cannot be repaired
    /// come back as results and must leave the send.
    async fn repair(
        &self,
        error: Error,
        access: &mut SealedSenderAccess,
        recipients: &[RecipientIdentity],
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        match error {
            Error::Transport(TransportError::GroupMismatchedDevices(entries)) => {
                self.reconciler
                    .handle_group_mismatched(&entries, recipients, cancel)
                    .await
            }
            Error::Transport(TransportError::GroupStaleDevices(entries)) => {
                self.reconciler.handle_group_stale(&entries, recipients)?;
                Ok(Vec::new())
            }
            Error::Transport(TransportError::AuthorizationFailed) => {
                let fallback = access.switch_to_fallback();
                if !fallback.is_sealed() {
                    return Err(Error::Transport(TransportError::AuthorizationFailed));
                }
                warn!("group send authorization failed, falling back to combined access key");
                *access = fallback;
                Ok(Vec::new())
            }
            Error::Transport(e) if e.is_transport_level() => {
                warn!(error = %e, "sender-key send failed on both transports");
                Ok(Vec::new())
            }
            other => Err(other),
        }
    }

    fn results_from_response(
        &self,
        target: &GroupTargetInfo,
        response: SendGroupMessageResponse,
    ) -> Result<Vec<SendMessageResult>> {
        let unsent: HashSet<ServiceId> = response.unsent_targets.into_iter().collect();
        let needs_sync = self.sessions.is_multi_device()?;

        Ok(target
            .devices
            .iter()
            .map(|(recipient, device_ids)| {
                if unsent.contains(&recipient.service_id()) {
                    SendMessageResult::unregistered_failure(recipient.clone())
                } else {
                    SendMessageResult::success(
                        recipient.clone(),
                        device_ids.clone(),
                        true,
                        needs_sync,
                        None,
                    )
                }
            })
            .collect())
    }
}

impl GroupMessage {
    fn retain_recipients(&mut self, mut keep: impl FnMut(&RecipientIdentity) -> bool) {
        let (recipients, accesses): (Vec<_>, Vec<_>) = self
            .recipients
            .drain(..)
            .zip(self.accesses.drain(..))
            .filter(|(recipient, _)| keep(recipient))
            .unzip();
        self.recipients = recipients;
        self.accesses = accesses;
    }
}

/// A combined token covers the full membership, so once members leave the
/// send only the remaining members' access keys still fit. Without keys for
/// all of them the current access is kept and the server decides.
fn access_for_remaining(current: SealedSenderAccess, members: &GroupMessage) -> SealedSenderAccess {
    match SealedSenderAccess::for_group_send(None, &members.accesses, members.story) {
        Ok(access) => access,
        Err(_) => current,
    }
}

fn merged(
    mut dropped: Vec<SendMessageResult>,
    results: Vec<SendMessageResult>,
) -> Vec<SendMessageResult> {
    dropped.extend(results);
    dropped
}

/// Failures as reported, plus a network failure for every other recipient,
/// since nobody got the group message.
fn with_untouched_recipients(
    mut failures: Vec<SendMessageResult>,
    recipients: &[RecipientIdentity],
) -> Vec<SendMessageResult> {
    let mut seen: HashSet<ServiceId> = failures.iter().map(|r| r.address.service_id()).collect();
    for recipient in recipients {
        if seen.insert(recipient.service_id()) {
            failures.push(SendMessageResult::network_failure(recipient.clone()));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_recipients_become_network_failures() {
        let a = RecipientIdentity::new(ServiceId::random());
        let b = RecipientIdentity::new(ServiceId::random());
        let failures = vec![SendMessageResult::unregistered_failure(a.clone())];

        let results = with_untouched_recipients(failures, &[a.clone(), b.clone(), b.clone()]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], SendMessageResult::unregistered_failure(a));
        assert_eq!(results[1], SendMessageResult::network_failure(b));
    }
}
