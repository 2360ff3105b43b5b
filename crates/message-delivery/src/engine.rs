//! Public send operations.
//!
//! `DeliveryEngine` wires the address book, encryptor, reconciler, retry and
//! fan-out coordinators together and exposes one method per kind of message.
//! Each operation returns per-recipient [`SendMessageResult`]s for outcomes a
//! caller is expected to act on, and an [`Error`] only for conditions that
//! have no per-recipient meaning.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::access::{GroupSendEndorsements, IndividualAccess, SealedSenderAccess};
use crate::address_book::AddressBook;
use crate::cancel::CancellationSignal;
use crate::cipher::SessionCipher;
use crate::config::EngineConfig;
use crate::content::{
    CallMessage, Content, ContentHint, DataMessage, DecryptionErrorMessage, EditMessage,
    EnvelopeContent, NullMessage, ReceiptMessage, SyncMessage, TypingMessage,
};
use crate::encryptor::EnvelopeEncryptor;
use crate::events::{NoopEvents, PartialSendListener, SecurityEventListener, SendEvents};
use crate::fanout::{GroupFanoutCoordinator, GroupMessage};
use crate::handshake::Handshake;
use crate::lock::SessionLocks;
use crate::reconciler::DeviceReconciler;
use crate::retry::{OutgoingMessage, RetryCoordinator};
use crate::sender_key_store::{InMemorySenderKeyStore, SenderKeyStore};
use crate::session_store::SessionStore;
use crate::sync_emitter::{SyncEmitter, TranscriptSource};
use crate::transport::TransportSelector;
use crate::types::{
    DistributionId, GroupId, RecipientIdentity, SendMessageResult, SenderKeyDistributionMessage,
};
use crate::utils::{now_millis, random_padding};
use crate::{Error, Result};

/// Audience of a sender-key send.
#[derive(Debug, Clone)]
pub struct GroupAudience {
    pub distribution_id: DistributionId,
    pub recipients: Vec<RecipientIdentity>,
    /// Parallel to `recipients`.
    pub accesses: Vec<Option<IndividualAccess>>,
    pub endorsements: Option<GroupSendEndorsements>,
}

impl GroupAudience {
    fn message(
        &self,
        timestamp: u64,
        content: Content,
        hint: ContentHint,
        group_id: Option<GroupId>,
    ) -> GroupMessage {
        GroupMessage {
            distribution_id: self.distribution_id,
            recipients: self.recipients.clone(),
            accesses: self.accesses.clone(),
            endorsements: self.endorsements.clone(),
            timestamp,
            content,
            hint,
            group_id,
            online: false,
            urgent: true,
            story: false,
        }
    }
}

pub struct DeliveryEngine {
    config: EngineConfig,
    address_book: AddressBook,
    transport: TransportSelector,
    retry: RetryCoordinator,
    fanout: GroupFanoutCoordinator,
    sync: SyncEmitter,
    events: Arc<dyn SendEvents>,
}

impl DeliveryEngine {
    pub fn new(
        config: EngineConfig,
        sessions: Arc<dyn SessionStore>,
        sender_keys: Option<Arc<dyn SenderKeyStore>>,
        cipher: Arc<dyn SessionCipher>,
        transport: TransportSelector,
        runtime: Handle,
    ) -> Result<Self> {
        Self::new_with_listeners(
            config,
            sessions,
            sender_keys,
            cipher,
            transport,
            runtime,
            Arc::new(NoopEvents),
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_with_listeners(
        config: EngineConfig,
        sessions: Arc<dyn SessionStore>,
        sender_keys: Option<Arc<dyn SenderKeyStore>>,
        cipher: Arc<dyn SessionCipher>,
        transport: TransportSelector,
        runtime: Handle,
        events: Arc<dyn SendEvents>,
        security: Option<Arc<dyn SecurityEventListener>>,
    ) -> Result<Self> {
        config.validate()?;

        let sender_keys =
            sender_keys.unwrap_or_else(|| Arc::new(InMemorySenderKeyStore::new()));
        let locks = SessionLocks::new();
        let address_book = AddressBook::new(sessions.clone(), config.local.clone());
        let handshake = Handshake::new(transport.clone(), cipher.clone(), security);
        let encryptor = EnvelopeEncryptor::new(
            address_book.clone(),
            cipher.clone(),
            handshake.clone(),
            locks.clone(),
            config.max_envelope_size,
        );
        let reconciler =
            DeviceReconciler::new(sessions.clone(), sender_keys.clone(), handshake, locks);
        let retry = RetryCoordinator::new(
            config.retry_count,
            sessions.clone(),
            encryptor.clone(),
            reconciler.clone(),
            transport.clone(),
            runtime,
        );
        let fanout = GroupFanoutCoordinator::new(
            address_book.clone(),
            sessions.clone(),
            sender_keys,
            cipher,
            encryptor,
            reconciler,
            transport.clone(),
            retry.clone(),
        );
        let sync = SyncEmitter::new(config.local.clone(), sessions, retry.clone());

        Ok(Self {
            config,
            address_book,
            transport,
            retry,
            fanout,
            sync,
            events,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // Core paths

    pub async fn send_to_one(
        &self,
        recipient: &RecipientIdentity,
        access: SealedSenderAccess,
        message: OutgoingMessage,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        let result = self
            .retry
            .send_to_one(recipient, access, &message, Some(self.events.as_ref()), cancel)
            .await?;
        self.events.on_message_sent();
        Ok(result)
    }

    pub async fn send_to_many(
        &self,
        recipients: &[RecipientIdentity],
        accesses: Vec<SealedSenderAccess>,
        message: OutgoingMessage,
        partial: Option<Arc<dyn PartialSendListener>>,
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        let results = self
            .retry
            .send_to_many(recipients, accesses, message, partial, cancel)
            .await?;
        self.events.on_message_sent();
        Ok(results)
    }

    pub async fn send_to_group(
        &self,
        message: &GroupMessage,
        partial: Option<Arc<dyn PartialSendListener>>,
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        let results = self
            .fanout
            .send(message, self.events.as_ref(), cancel)
            .await?;
        if let Some(listener) = partial {
            listener.on_partial_send_complete(&results);
        }
        self.events.on_message_sent();
        Ok(results)
    }

    // Data messages

    /// Send a data message and mirror it to our linked devices on success.
    pub async fn send_data_message(
        &self,
        recipient: &RecipientIdentity,
        access: Option<IndividualAccess>,
        message: &DataMessage,
        hint: ContentHint,
        urgent: bool,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        message.validate()?;
        let content = EnvelopeContent::encrypted(
            Content::data(message.clone()),
            hint,
            message.group_id.clone(),
        );
        let outgoing = OutgoingMessage::new(message.timestamp, content).urgent(urgent);
        let result = self
            .send_to_one(recipient, SealedSenderAccess::individual(access), outgoing, cancel)
            .await?;

        if result.is_success() {
            let recipients = std::slice::from_ref(recipient);
            self.sync
                .emit_transcript(
                    TranscriptSource::data(recipients, message),
                    std::slice::from_ref(&result),
                    self.events.as_ref(),
                    cancel,
                )
                .await?;
        }
        Ok(result)
    }

    pub async fn send_data_message_to_many(
        &self,
        recipients: &[RecipientIdentity],
        accesses: Vec<Option<IndividualAccess>>,
        message: &DataMessage,
        hint: ContentHint,
        partial: Option<Arc<dyn PartialSendListener>>,
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        message.validate()?;
        let content = EnvelopeContent::encrypted(
            Content::data(message.clone()),
            hint,
            message.group_id.clone(),
        );
        let outgoing = OutgoingMessage::new(message.timestamp, content).urgent(true);
        let accesses = accesses
            .into_iter()
            .map(SealedSenderAccess::individual)
            .collect();
        // Linked devices still learn about recipients that were reached when
        // others failed.
        let (results, errors) = match self
            .send_to_many(recipients, accesses, outgoing, partial, cancel)
            .await
        {
            Ok(results) => (results, Vec::new()),
            Err(Error::FanOut { results, errors }) => (results, errors),
            Err(e) => return Err(e),
        };

        self.sync
            .emit_transcript(
                TranscriptSource::data(recipients, message),
                &results,
                self.events.as_ref(),
                cancel,
            )
            .await?;
        if errors.is_empty() {
            Ok(results)
        } else {
            Err(Error::FanOut { results, errors })
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_edit_message(
        &self,
        recipient: &RecipientIdentity,
        access: Option<IndividualAccess>,
        timestamp: u64,
        edit: &EditMessage,
        hint: ContentHint,
        urgent: bool,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        edit.data_message.validate()?;
        let content = EnvelopeContent::encrypted(
            Content::edit(edit.clone()),
            hint,
            edit.data_message.group_id.clone(),
        );
        let outgoing = OutgoingMessage::new(timestamp, content).urgent(urgent);
        let result = self
            .send_to_one(recipient, SealedSenderAccess::individual(access), outgoing, cancel)
            .await?;

        if result.is_success() {
            let recipients = std::slice::from_ref(recipient);
            self.sync
                .emit_transcript(
                    TranscriptSource::edit(recipients, timestamp, edit),
                    std::slice::from_ref(&result),
                    self.events.as_ref(),
                    cancel,
                )
                .await?;
        }
        Ok(result)
    }

    /// Sender-key send of a group data message, followed by one transcript.
    pub async fn send_group_data_message(
        &self,
        audience: &GroupAudience,
        message: &DataMessage,
        hint: ContentHint,
        urgent: bool,
        partial: Option<Arc<dyn PartialSendListener>>,
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        message.validate()?;
        let mut group_message = audience.message(
            message.timestamp,
            Content::data(message.clone()),
            hint,
            message.group_id.clone(),
        );
        group_message.urgent = urgent;

        let results = self.send_to_group(&group_message, partial, cancel).await?;

        self.sync
            .emit_transcript(
                TranscriptSource::data(&audience.recipients, message),
                &results,
                self.events.as_ref(),
                cancel,
            )
            .await?;
        Ok(results)
    }

    // Ephemeral messages

    pub async fn send_typing(
        &self,
        recipients: &[RecipientIdentity],
        accesses: Vec<Option<IndividualAccess>>,
        message: &TypingMessage,
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        let content = EnvelopeContent::encrypted(
            Content::typing(message.clone()),
            ContentHint::Implicit,
            message.group_id.clone(),
        );
        let outgoing = OutgoingMessage::new(message.timestamp, content).online(true);
        let accesses = accesses
            .into_iter()
            .map(SealedSenderAccess::individual)
            .collect();
        self.retry
            .send_to_many(recipients, accesses, outgoing, None, cancel)
            .await
    }

    pub async fn send_group_typing(
        &self,
        audience: &GroupAudience,
        message: &TypingMessage,
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        let group_id = message.group_id.clone().ok_or_else(|| {
            Error::InvalidArgument("group typing message without a group id".to_string())
        })?;
        let mut group_message = audience.message(
            message.timestamp,
            Content::typing(message.clone()),
            ContentHint::Implicit,
            Some(group_id),
        );
        group_message.online = true;
        group_message.urgent = false;

        self.fanout
            .send(&group_message, self.events.as_ref(), cancel)
            .await
    }

    pub async fn send_receipt(
        &self,
        recipient: &RecipientIdentity,
        access: Option<IndividualAccess>,
        message: &ReceiptMessage,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        let content = EnvelopeContent::encrypted(
            Content::receipt(message.clone()),
            ContentHint::Implicit,
            None,
        );
        let outgoing = OutgoingMessage::new(message.when, content);
        self.retry
            .send_to_one(
                recipient,
                SealedSenderAccess::individual(access),
                &outgoing,
                None,
                cancel,
            )
            .await
    }

    /// Ask the sender of an undecryptable message to resend it. Goes out as
    /// plaintext content since there may be no working session.
    pub async fn send_retry_receipt(
        &self,
        recipient: &RecipientIdentity,
        access: Option<IndividualAccess>,
        group_id: Option<GroupId>,
        error: &DecryptionErrorMessage,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        let content = EnvelopeContent::plaintext(error.clone(), group_id);
        let outgoing = OutgoingMessage::new(now_millis(), content);
        self.retry
            .send_to_one(
                recipient,
                SealedSenderAccess::individual(access),
                &outgoing,
                None,
                cancel,
            )
            .await
    }

    pub async fn send_call_message(
        &self,
        recipient: &RecipientIdentity,
        access: Option<IndividualAccess>,
        message: &CallMessage,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        let outgoing = call_outgoing(message);
        self.retry
            .send_to_one(
                recipient,
                SealedSenderAccess::individual(access),
                &outgoing,
                None,
                cancel,
            )
            .await
    }

    pub async fn send_call_message_to_many(
        &self,
        recipients: &[RecipientIdentity],
        accesses: Vec<Option<IndividualAccess>>,
        message: &CallMessage,
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        let accesses = accesses
            .into_iter()
            .map(SealedSenderAccess::individual)
            .collect();
        self.retry
            .send_to_many(recipients, accesses, call_outgoing(message), None, cancel)
            .await
    }

    pub async fn send_null_message(
        &self,
        recipient: &RecipientIdentity,
        access: Option<IndividualAccess>,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        let padding = random_padding(self.config.null_message_padding_max);
        let content = EnvelopeContent::encrypted(
            Content::null(NullMessage { padding }),
            ContentHint::Implicit,
            None,
        );
        let outgoing = OutgoingMessage::new(now_millis(), content);
        self.retry
            .send_to_one(
                recipient,
                SealedSenderAccess::individual(access),
                &outgoing,
                None,
                cancel,
            )
            .await
    }

    // Sync messages

    pub async fn send_sync_message(
        &self,
        message: SyncMessage,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        self.sync
            .send_sync(message, self.events.as_ref(), cancel)
            .await
    }

    /// Transcript of a note-to-self, which has no other recipient to send to.
    pub async fn send_self_sync_message(
        &self,
        message: &DataMessage,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        message.validate()?;
        let me = [self.address_book.local().identity()];
        let transcript = TranscriptSource::data(&me, message).build(&[]);
        self.sync
            .send_sync(SyncMessage::Sent(transcript), self.events.as_ref(), cancel)
            .await
    }

    /// Resend previously sent content after a retry request. Our own devices
    /// are never reached with sealed sender.
    #[allow(clippy::too_many_arguments)]
    pub async fn resend_content(
        &self,
        recipient: &RecipientIdentity,
        access: Option<IndividualAccess>,
        timestamp: u64,
        content: Content,
        hint: ContentHint,
        group_id: Option<GroupId>,
        urgent: bool,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        let access = if self.address_book.is_local(recipient) {
            SealedSenderAccess::None
        } else {
            SealedSenderAccess::individual(access)
        };
        let content = EnvelopeContent::encrypted(content, hint, group_id);
        let outgoing = OutgoingMessage::new(timestamp, content).urgent(urgent);
        debug!(timestamp, recipient = %recipient, sealed = access.is_sealed(), "resending content");
        self.retry
            .send_to_one(recipient, access, &outgoing, None, cancel)
            .await
    }

    // Sender keys

    pub fn get_or_create_group_session(
        &self,
        distribution_id: DistributionId,
    ) -> Result<SenderKeyDistributionMessage> {
        self.fanout.distribution_message(distribution_id)
    }

    /// Hand the current sender key to every recipient in `audience`,
    /// whether or not they are already recorded as having it.
    pub async fn send_sender_key_distribution(
        &self,
        audience: &GroupAudience,
        group_id: Option<&GroupId>,
        urgent: bool,
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        info!(
            distribution_id = %audience.distribution_id,
            recipients = audience.recipients.len(),
            "sending sender key distribution"
        );
        let results = self
            .fanout
            .share_sender_key(
                audience.distribution_id,
                &audience.recipients,
                audience.accesses.clone(),
                audience.endorsements.as_ref(),
                group_id,
                now_millis(),
                urgent,
                false,
                cancel,
            )
            .await?;
        if results.iter().any(SendMessageResult::is_success) {
            self.events.on_sender_key_shared();
        }
        Ok(results)
    }

    pub fn cancel_in_flight_requests(&self) {
        self.transport.cancel_in_flight_requests();
    }
}

fn call_outgoing(message: &CallMessage) -> OutgoingMessage {
    let timestamp = message.timestamp.unwrap_or_else(now_millis);
    let content = EnvelopeContent::encrypted(
        Content::call(message.clone()),
        ContentHint::Default,
        message.group_id.clone(),
    );
    OutgoingMessage::new(timestamp, content).urgent(message.urgent)
}
