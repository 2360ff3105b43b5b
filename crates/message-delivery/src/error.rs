use std::time::Duration;

use thiserror::Error;

use crate::types::{
    DeviceAddress, GroupMismatchedDevices, GroupStaleDevices, IdentityKey, MismatchedDevices,
    RecipientIdentity, SendMessageResult, StaleDevices,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Content too large: {size} bytes exceeds maximum of {max}")]
    ContentTooLarge { size: usize, max: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Send canceled")]
    Canceled,

    #[error("Failed to resolve conflicts after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Untrusted identity key for {name}")]
    UntrustedIdentity {
        name: String,
        identity_key: IdentityKey,
    },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid prekey bundle for {0}")]
    InvalidPreKey(DeviceAddress),

    #[error("No session for {0}")]
    NoSession(DeviceAddress),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Send task failed: {0}")]
    Task(String),

    /// Some recipients of a fan-out ended in errors no result describes.
    /// `results` holds the outcome of every other recipient.
    #[error("Send failed for {} recipients ({} settled)", .errors.len(), .results.len())]
    FanOut {
        results: Vec<SendMessageResult>,
        errors: Vec<(RecipientIdentity, Error)>,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a single network call on either transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Persistent channel unavailable: {0}")]
    Unavailable(String),

    #[error("Network failure: {0}")]
    Io(String),

    #[error("Mismatched devices (missing {:?}, extra {:?})", .0.missing_devices, .0.extra_devices)]
    MismatchedDevices(MismatchedDevices),

    #[error("Stale devices {:?}", .0.stale_devices)]
    StaleDevices(StaleDevices),

    #[error("Mismatched devices for {} group recipients", .0.len())]
    GroupMismatchedDevices(Vec<GroupMismatchedDevices>),

    #[error("Stale devices for {} group recipients", .0.len())]
    GroupStaleDevices(Vec<GroupStaleDevices>),

    #[error("Recipient is not registered")]
    Unregistered,

    #[error("Not found")]
    NotFound,

    #[error("Authorization failed")]
    AuthorizationFailed,

    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Proof required")]
    ProofRequired { token: String, options: Vec<String> },

    #[error("Server rejected the request")]
    ServerRejected,

    #[error("Unexpected response status {code}")]
    Status { code: u16 },
}

impl TransportError {
    /// Errors that say nothing about the message itself and may succeed over
    /// the other transport.
    pub fn is_transport_level(&self) -> bool {
        matches!(self, TransportError::Unavailable(_) | TransportError::Io(_))
    }

    /// Map an HTTP status and JSON body into a transport error.
    ///
    /// `group` selects the per-recipient body shapes used by the sender-key
    /// endpoint for 409/410 and treats 404 as "group target not found".
    pub fn from_status(code: u16, body: &str, group: bool) -> TransportError {
        match code {
            401 => TransportError::AuthorizationFailed,
            404 if group => TransportError::NotFound,
            404 => TransportError::Unregistered,
            409 if group => serde_json::from_str(body)
                .map(TransportError::GroupMismatchedDevices)
                .unwrap_or(TransportError::Status { code }),
            409 => serde_json::from_str(body)
                .map(TransportError::MismatchedDevices)
                .unwrap_or(TransportError::Status { code }),
            410 if group => serde_json::from_str(body)
                .map(TransportError::GroupStaleDevices)
                .unwrap_or(TransportError::Status { code }),
            410 => serde_json::from_str(body)
                .map(TransportError::StaleDevices)
                .unwrap_or(TransportError::Status { code }),
            413 | 429 => TransportError::RateLimited { retry_after: None },
            428 => serde_json::from_str::<ProofRequiredBody>(body)
                .map(|b| TransportError::ProofRequired {
                    token: b.token,
                    options: b.options,
                })
                .unwrap_or(TransportError::Status { code }),
            508 => TransportError::ServerRejected,
            _ => TransportError::Status { code },
        }
    }
}

#[derive(serde::Deserialize)]
struct ProofRequiredBody {
    token: String,
    #[serde(default)]
    options: Vec<String>,
}
