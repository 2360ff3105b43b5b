use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Device id of a recipient's primary device.
pub const DEFAULT_DEVICE_ID: u32 = 1;

/// Number of attempts a send gets before giving up on conflict resolution.
pub const DEFAULT_RETRY_COUNT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(Uuid);

impl ServiceId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ServiceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A logical recipient. Two identities are equal when their service ids are,
/// regardless of the phone-number alias either one carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientIdentity {
    service_id: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    e164: Option<String>,
}

impl RecipientIdentity {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            e164: None,
        }
    }

    pub fn with_e164(service_id: ServiceId, e164: impl Into<String>) -> Self {
        Self {
            service_id,
            e164: Some(e164.into()),
        }
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn e164(&self) -> Option<&str> {
        self.e164.as_deref()
    }

    /// Session-store name of this recipient.
    pub fn identifier(&self) -> String {
        self.service_id.to_string()
    }

    pub fn device(&self, device_id: u32) -> DeviceAddress {
        DeviceAddress::new(self.identifier(), device_id)
    }

    /// Address of the same device keyed by the phone-number alias, if any.
    pub fn alias_device(&self, device_id: u32) -> Option<DeviceAddress> {
        self.e164
            .as_ref()
            .map(|e164| DeviceAddress::new(e164.clone(), device_id))
    }
}

impl PartialEq for RecipientIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.service_id == other.service_id
    }
}

impl Eq for RecipientIdentity {}

impl Hash for RecipientIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.service_id.hash(state);
    }
}

impl fmt::Display for RecipientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.service_id.fmt(f)
    }
}

/// A single device of a recipient: the unit of encryption and transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAddress {
    pub name: String,
    pub device_id: u32,
}

impl DeviceAddress {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

/// Identifies a sender-key session (a group chat or a story list).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistributionId(Uuid);

impl DistributionId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for DistributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque group identifier attached to group content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(#[serde(with = "hex::serde")] pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(#[serde(with = "hex::serde")] pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderCertificate(#[serde(with = "hex::serde")] pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderKeyDistributionMessage(#[serde(with = "hex::serde")] pub Vec<u8>);

impl SenderKeyDistributionMessage {
    pub fn serialize(&self) -> &[u8] {
        &self.0
    }
}

/// Prekey material fetched from the server for one device. Opaque to this
/// crate apart from the device it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    pub device_id: u32,
    pub registration_id: u32,
    pub identity_key: IdentityKey,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeType {
    Ciphertext,
    PreKeyBundle,
    UnidentifiedSender,
    Plaintext,
}

/// One encrypted envelope addressed to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingPushMessage {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub destination_device_id: u32,
    pub destination_registration_id: u32,
    #[serde(with = "hex::serde")]
    pub content: Vec<u8>,
}

/// All envelopes for one logical message to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingPushMessageList {
    pub destination: String,
    pub timestamp: u64,
    pub messages: Vec<OutgoingPushMessage>,
    pub online: bool,
    pub urgent: bool,
}

impl OutgoingPushMessageList {
    pub fn devices(&self) -> Vec<u32> {
        self.messages
            .iter()
            .map(|m| m.destination_device_id)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchedDevices {
    #[serde(default)]
    pub missing_devices: Vec<u32>,
    #[serde(default)]
    pub extra_devices: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleDevices {
    #[serde(default)]
    pub stale_devices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMismatchedDevices {
    #[serde(rename = "uuid")]
    pub service_id: ServiceId,
    pub devices: MismatchedDevices,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStaleDevices {
    #[serde(rename = "uuid")]
    pub service_id: ServiceId,
    pub devices: StaleDevices,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    #[serde(default)]
    pub needs_sync: bool,
    /// Set by the transport when the request went out with sealed-sender access.
    #[serde(skip)]
    pub sent_unidentified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendGroupMessageResponse {
    #[serde(rename = "uuids404", alias = "unsentTargets", default)]
    pub unsent_targets: Vec<ServiceId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSuccess {
    pub devices: Vec<u32>,
    pub unidentified: bool,
    pub needs_sync: bool,
    /// Wall time of the send. Group sends report no per-recipient duration.
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success(SendSuccess),
    IdentityFailure { identity_key: IdentityKey },
    UnregisteredFailure,
    NetworkFailure,
    RateLimitFailure { retry_after: Option<Duration> },
    ProofRequiredFailure { token: String, options: Vec<String> },
    InvalidPreKeyFailure,
}

/// Outcome of one logical send for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageResult {
    pub address: RecipientIdentity,
    pub outcome: SendOutcome,
}

impl SendMessageResult {
    pub fn success(
        address: RecipientIdentity,
        devices: Vec<u32>,
        unidentified: bool,
        needs_sync: bool,
        duration: Option<Duration>,
    ) -> Self {
        Self {
            address,
            outcome: SendOutcome::Success(SendSuccess {
                devices,
                unidentified,
                needs_sync,
                duration,
            }),
        }
    }

    pub fn network_failure(address: RecipientIdentity) -> Self {
        Self {
            address,
            outcome: SendOutcome::NetworkFailure,
        }
    }

    pub fn unregistered_failure(address: RecipientIdentity) -> Self {
        Self {
            address,
            outcome: SendOutcome::UnregisteredFailure,
        }
    }

    pub fn identity_failure(address: RecipientIdentity, identity_key: IdentityKey) -> Self {
        Self {
            address,
            outcome: SendOutcome::IdentityFailure { identity_key },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SendOutcome::Success(_))
    }

    pub fn is_network_failure(&self) -> bool {
        matches!(self.outcome, SendOutcome::NetworkFailure)
    }

    pub fn success_details(&self) -> Option<&SendSuccess> {
        match &self.outcome {
            SendOutcome::Success(success) => Some(success),
            _ => None,
        }
    }
}
