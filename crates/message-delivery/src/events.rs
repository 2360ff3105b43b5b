use crossbeam_channel::Sender;
use tracing::debug;

use crate::types::{RecipientIdentity, SendMessageResult};

/// Progress callbacks for one logical send.
pub trait SendEvents: Send + Sync {
    /// Fired after the first successful encryption of the message.
    fn on_message_encrypted(&self) {}
    fn on_message_sent(&self) {}
    fn on_sync_message_sent(&self) {}
    /// Group sends only: every destination holds the sender key.
    fn on_sender_key_shared(&self) {}
}

/// Receives results as individual recipients (or a group batch) complete.
/// Called from whichever task finished the send, never the caller's.
pub trait PartialSendListener: Send + Sync {
    fn on_partial_send_complete(&self, results: &[SendMessageResult]);
}

/// Notified when a new session is built for a recipient from a prekey bundle.
pub trait SecurityEventListener: Send + Sync {
    fn on_security_event(&self, recipient: &RecipientIdentity);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl SendEvents for NoopEvents {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    MessageEncrypted,
    MessageSent,
    SyncMessageSent,
    SenderKeyShared,
    PartialSendComplete(Vec<SendMessageResult>),
    NewSession(RecipientIdentity),
}

/// Forwards every callback into a channel so a consumer can handle them on
/// its own thread.
#[derive(Clone)]
pub struct ChannelListener {
    event_tx: Sender<DeliveryEvent>,
}

impl ChannelListener {
    pub fn new(event_tx: Sender<DeliveryEvent>) -> Self {
        Self { event_tx }
    }

    fn emit(&self, event: DeliveryEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("delivery event receiver dropped");
        }
    }
}

impl SendEvents for ChannelListener {
    fn on_message_encrypted(&self) {
        self.emit(DeliveryEvent::MessageEncrypted);
    }

    fn on_message_sent(&self) {
        self.emit(DeliveryEvent::MessageSent);
    }

    fn on_sync_message_sent(&self) {
        self.emit(DeliveryEvent::SyncMessageSent);
    }

    fn on_sender_key_shared(&self) {
        self.emit(DeliveryEvent::SenderKeyShared);
    }
}

impl PartialSendListener for ChannelListener {
    fn on_partial_send_complete(&self, results: &[SendMessageResult]) {
        self.emit(DeliveryEvent::PartialSendComplete(results.to_vec()));
    }
}

impl SecurityEventListener for ChannelListener {
    fn on_security_event(&self, recipient: &RecipientIdentity) {
        self.emit(DeliveryEvent::NewSession(recipient.clone()));
    }
}
