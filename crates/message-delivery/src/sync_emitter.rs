use std::sync::Arc;

use tracing::debug;

use crate::access::SealedSenderAccess;
use crate::cancel::CancellationSignal;
use crate::config::LocalAccount;
use crate::content::{
    Content, ContentHint, DataMessage, EditMessage, EnvelopeContent, SentTranscript, SyncMessage,
    UnidentifiedDeliveryStatus,
};
use crate::events::SendEvents;
use crate::retry::{OutgoingMessage, RetryCoordinator};
use crate::session_store::SessionStore;
use crate::types::{RecipientIdentity, SendMessageResult};
use crate::utils::now_millis;
use crate::Result;

/// Mirrors what this device sent to the account's other devices.
#[derive(Clone)]
pub struct SyncEmitter {
    local: LocalAccount,
    sessions: Arc<dyn SessionStore>,
    retry: RetryCoordinator,
}

impl SyncEmitter {
    pub fn new(
        local: LocalAccount,
        sessions: Arc<dyn SessionStore>,
        retry: RetryCoordinator,
    ) -> Self {
        Self {
            local,
            sessions,
            retry,
        }
    }

    /// True when the server asked for a sync on any result, or when we know
    /// about linked devices ourselves.
    pub fn needs_sync(&self, results: &[SendMessageResult]) -> Result<bool> {
        let requested = results
            .iter()
            .filter_map(|r| r.success_details())
            .any(|s| s.needs_sync);
        if requested {
            return Ok(true);
        }
        self.sessions.is_multi_device()
    }

    /// Send one sync message to our own identity, unsealed.
    pub async fn send_sync(
        &self,
        message: SyncMessage,
        events: &dyn SendEvents,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        let timestamp = message.sent_timestamp().unwrap_or_else(now_millis);
        let urgent = message.is_urgent();
        let content =
            EnvelopeContent::encrypted(Content::sync(message), ContentHint::Implicit, None);
        let outgoing = OutgoingMessage::new(timestamp, content).urgent(urgent);

        debug!(timestamp, urgent, "sending sync message");
        let result = self
            .retry
            .send_to_one(
                &self.local.identity(),
                SealedSenderAccess::None,
                &outgoing,
                None,
                cancel,
            )
            .await?;
        events.on_sync_message_sent();
        Ok(result)
    }

    /// Send a sent-transcript for a completed send, if one is needed. At most
    /// one transcript goes out however many recipients there were.
    pub async fn emit_transcript(
        &self,
        transcript: TranscriptSource<'_>,
        results: &[SendMessageResult],
        events: &dyn SendEvents,
        cancel: &CancellationSignal,
    ) -> Result<Option<SendMessageResult>> {
        if !self.needs_sync(results)? {
            return Ok(None);
        }
        let transcript = transcript.build(results);
        self.send_sync(SyncMessage::Sent(transcript), events, cancel)
            .await
            .map(Some)
    }
}

/// What a sent transcript describes.
#[derive(Debug, Clone, Copy)]
pub struct TranscriptSource<'a> {
    pub recipients: &'a [RecipientIdentity],
    pub timestamp: u64,
    pub message: Option<&'a DataMessage>,
    pub edit: Option<&'a EditMessage>,
    pub is_recipient_update: bool,
}

impl<'a> TranscriptSource<'a> {
    pub fn data(recipients: &'a [RecipientIdentity], message: &'a DataMessage) -> Self {
        Self {
            recipients,
            timestamp: message.timestamp,
            message: Some(message),
            edit: None,
            is_recipient_update: false,
        }
    }

    pub fn edit(
        recipients: &'a [RecipientIdentity],
        timestamp: u64,
        edit: &'a EditMessage,
    ) -> Self {
        Self {
            recipients,
            timestamp,
            message: None,
            edit: Some(edit),
            is_recipient_update: false,
        }
    }

    pub fn build(&self, results: &[SendMessageResult]) -> SentTranscript {
        let data = self.message.or(self.edit.map(|e| &e.data_message));
        let is_group = data.is_some_and(DataMessage::is_group);

        let (destination, destination_e164) = match self.recipients {
            [single] if !is_group => (
                Some(single.service_id()),
                single.e164().map(str::to_string),
            ),
            _ => (None, None),
        };

        let expiration_start_timestamp = data
            .filter(|m| m.expire_timer > 0)
            .map(|_| now_millis());

        let unidentified_statuses = results
            .iter()
            .filter_map(|r| {
                r.success_details().map(|s| UnidentifiedDeliveryStatus {
                    destination: r.address.service_id(),
                    unidentified: s.unidentified,
                })
            })
            .collect();

        SentTranscript {
            destination,
            destination_e164,
            timestamp: self.timestamp,
            message: self.message.cloned(),
            edit_message: self.edit.cloned(),
            expiration_start_timestamp,
            unidentified_statuses,
            is_recipient_update: self.is_recipient_update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupId, ServiceId};

    fn recipient() -> RecipientIdentity {
        RecipientIdentity::with_e164(ServiceId::random(), "+15555550123")
    }

    #[test]
    fn single_recipient_transcript_has_destination() {
        let r = recipient();
        let recipients = [r.clone()];
        let message = DataMessage::text(10, "hi");
        let results = [SendMessageResult::success(r.clone(), vec![1], true, false, None)];

        let transcript = TranscriptSource::data(&recipients, &message).build(&results);
        assert_eq!(transcript.destination, Some(r.service_id()));
        assert_eq!(transcript.destination_e164.as_deref(), Some("+15555550123"));
        assert_eq!(transcript.timestamp, 10);
        assert_eq!(transcript.expiration_start_timestamp, None);
        assert_eq!(
            transcript.unidentified_statuses,
            vec![UnidentifiedDeliveryStatus {
                destination: r.service_id(),
                unidentified: true
            }]
        );
    }

    #[test]
    fn group_transcript_has_no_destination() {
        let r = recipient();
        let recipients = [r.clone()];
        let mut message = DataMessage::text(10, "hi");
        message.group_id = Some(GroupId(vec![1, 2]));

        let transcript = TranscriptSource::data(&recipients, &message).build(&[]);
        assert_eq!(transcript.destination, None);
    }

    #[test]
    fn failures_are_left_out_of_statuses() {
        let a = recipient();
        let b = RecipientIdentity::new(ServiceId::random());
        let recipients = [a.clone(), b.clone()];
        let mut message = DataMessage::text(10, "hi");
        message.expire_timer = 60;
        let results = [
            SendMessageResult::success(a, vec![1], false, true, None),
            SendMessageResult::network_failure(b),
        ];

        let transcript = TranscriptSource::data(&recipients, &message).build(&results);
        assert_eq!(transcript.destination, None);
        assert_eq!(transcript.unidentified_statuses.len(), 1);
        assert!(transcript.expiration_start_timestamp.is_some());
    }
}
