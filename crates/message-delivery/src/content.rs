//! Plaintext content handed to the session cipher.
//!
//! The wire encoding of the inner content is not this crate's concern; JSON is
//! used as a stand-in so that size limits can be enforced on something real.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{GroupId, SenderKeyDistributionMessage, ServiceId};

/// How a recipient should treat this content if it fails to decrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentHint {
    /// Show an error to the user.
    #[default]
    Default,
    /// Ask for a resend and show a placeholder meanwhile.
    Resendable,
    /// Ask for a resend quietly.
    Implicit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    pub service_id: ServiceId,
    pub start: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<Mention>,
    /// Disappearing-message timer in seconds, 0 when off.
    #[serde(default)]
    pub expire_timer: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub view_once: bool,
}

impl DataMessage {
    pub fn text(timestamp: u64, body: impl Into<String>) -> Self {
        Self {
            timestamp,
            body: Some(body.into()),
            ..Default::default()
        }
    }

    /// Mention ranges are UTF-16 offsets and must fall inside the body.
    pub fn validate(&self) -> Result<()> {
        if self.mentions.is_empty() {
            return Ok(());
        }

        let body_len = self
            .body
            .as_deref()
            .map(|b| b.encode_utf16().count())
            .unwrap_or(0) as u64;

        for mention in &self.mentions {
            let end = u64::from(mention.start) + u64::from(mention.length);
            if end > body_len {
                return Err(Error::InvalidArgument(format!(
                    "mention of {} at {}..{} is outside the body",
                    mention.service_id, mention.start, end
                )));
            }
        }
        Ok(())
    }

    pub fn is_group(&self) -> bool {
        self.group_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub target_sent_timestamp: u64,
    pub data_message: DataMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TypingAction {
    Started,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingMessage {
    pub timestamp: u64,
    pub action: TypingAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReceiptKind {
    Delivery,
    Read,
    Viewed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptMessage {
    pub kind: ReceiptKind,
    pub timestamps: Vec<u64>,
    /// When the receipt was generated.
    pub when: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallMessageKind {
    Offer,
    Answer,
    IceUpdate,
    Busy,
    Hangup,
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMessage {
    pub kind: CallMessageKind,
    pub call_id: u64,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_device_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub urgent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NullMessage {
    /// Random base64 padding so null messages are not distinguishable by size.
    pub padding: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnidentifiedDeliveryStatus {
    pub destination: ServiceId,
    pub unidentified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentTranscript {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<ServiceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_e164: Option<String>,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<DataMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_message: Option<EditMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_start_timestamp: Option<u64>,
    #[serde(default)]
    pub unidentified_statuses: Vec<UnidentifiedDeliveryStatus>,
    #[serde(default)]
    pub is_recipient_update: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMessage {
    pub sender: ServiceId,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchType {
    LocalProfile,
    StorageManifest,
    SubscriptionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageRequestAction {
    Accept,
    Delete,
    Block,
    BlockAndDelete,
    Spam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestType {
    Contacts,
    Blocked,
    Configuration,
    Keys,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_receipts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing_indicators: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_previews: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unidentified_delivery_indicators: Option<bool>,
}

/// A message to the account's own linked devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMessage {
    Sent(SentTranscript),
    Read(Vec<ReadMessage>),
    Viewed(Vec<ReadMessage>),
    ViewOnceOpen(ReadMessage),
    Blocked {
        service_ids: Vec<ServiceId>,
        group_ids: Vec<GroupId>,
    },
    Configuration(Configuration),
    FetchLatest(FetchType),
    MessageRequestResponse {
        thread: ServiceId,
        action: MessageRequestAction,
    },
    Keys {
        #[serde(with = "hex::serde")]
        master_key: Vec<u8>,
    },
    Request {
        request: RequestType,
        urgent: bool,
    },
}

impl SyncMessage {
    /// Read syncs and requests flagged urgent wake the linked devices.
    pub fn is_urgent(&self) -> bool {
        match self {
            SyncMessage::Read(_) => true,
            SyncMessage::Request { urgent, .. } => *urgent,
            _ => false,
        }
    }

    pub fn sent_timestamp(&self) -> Option<u64> {
        match self {
            SyncMessage::Sent(transcript) => Some(transcript.timestamp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_message: Option<DataMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_message: Option<EditMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_message: Option<SyncMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing_message: Option<TypingMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_message: Option<ReceiptMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_message: Option<CallMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub null_message: Option<NullMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key_distribution_message: Option<SenderKeyDistributionMessage>,
}

impl Content {
    pub fn data(message: DataMessage) -> Self {
        Self {
            data_message: Some(message),
            ..Default::default()
        }
    }

    pub fn edit(message: EditMessage) -> Self {
        Self {
            edit_message: Some(message),
            ..Default::default()
        }
    }

    pub fn sync(message: SyncMessage) -> Self {
        Self {
            sync_message: Some(message),
            ..Default::default()
        }
    }

    pub fn typing(message: TypingMessage) -> Self {
        Self {
            typing_message: Some(message),
            ..Default::default()
        }
    }

    pub fn receipt(message: ReceiptMessage) -> Self {
        Self {
            receipt_message: Some(message),
            ..Default::default()
        }
    }

    pub fn call(message: CallMessage) -> Self {
        Self {
            call_message: Some(message),
            ..Default::default()
        }
    }

    pub fn null(message: NullMessage) -> Self {
        Self {
            null_message: Some(message),
            ..Default::default()
        }
    }

    pub fn sender_key_distribution(message: SenderKeyDistributionMessage) -> Self {
        Self {
            sender_key_distribution_message: Some(message),
            ..Default::default()
        }
    }
}

/// Describes a message a recipient could not decrypt, sent back as a retry
/// receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptionErrorMessage {
    pub timestamp: u64,
    pub device_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratchet_key: Option<String>,
}

/// What actually goes through the session cipher for one logical send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum EnvelopeContent {
    Encrypted {
        content: Content,
        hint: ContentHint,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
    },
    Plaintext {
        decryption_error: DecryptionErrorMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
    },
}

impl EnvelopeContent {
    pub fn encrypted(content: Content, hint: ContentHint, group_id: Option<GroupId>) -> Self {
        EnvelopeContent::Encrypted {
            content,
            hint,
            group_id,
        }
    }

    pub fn plaintext(decryption_error: DecryptionErrorMessage, group_id: Option<GroupId>) -> Self {
        EnvelopeContent::Plaintext {
            decryption_error,
            group_id,
        }
    }

    pub fn content(&self) -> Option<&Content> {
        match self {
            EnvelopeContent::Encrypted { content, .. } => Some(content),
            EnvelopeContent::Plaintext { .. } => None,
        }
    }

    pub fn hint(&self) -> ContentHint {
        match self {
            EnvelopeContent::Encrypted { hint, .. } => *hint,
            EnvelopeContent::Plaintext { .. } => ContentHint::Implicit,
        }
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            EnvelopeContent::Encrypted { group_id, .. } => group_id.as_ref(),
            EnvelopeContent::Plaintext { group_id, .. } => group_id.as_ref(),
        }
    }

    /// Encoded size of the payload before encryption.
    pub fn size(&self) -> Result<usize> {
        let encoded = match self {
            EnvelopeContent::Encrypted { content, .. } => serde_json::to_vec(content)?,
            EnvelopeContent::Plaintext {
                decryption_error, ..
            } => serde_json::to_vec(decryption_error)?,
        };
        Ok(encoded.len())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
