//! Delivery engine for end-to-end encrypted messages.
//!
//! Turns one logical message into per-device envelopes (or a single
//! sender-key ciphertext for groups), moves them over a persistent channel
//! with a REST fallback, repairs device and session state from server
//! feedback, retries within a fixed budget and mirrors what was sent to the
//! account's linked devices.

pub mod access;
pub mod address_book;
pub mod cancel;
pub mod cipher;
pub mod config;
pub mod content;
pub mod encryptor;
pub mod engine;
pub mod error;
pub mod events;
pub mod fanout;
pub mod handshake;
pub mod lock;
pub mod reconciler;
pub mod retry;
pub mod sender_key_store;
pub mod session_store;
pub mod storage;
pub mod sync_emitter;
pub mod transport;
pub mod types;
pub mod utils;

pub use access::{GroupSendEndorsements, GroupSendToken, IndividualAccess, SealedSenderAccess};
pub use cancel::CancellationSignal;
pub use cipher::SessionCipher;
pub use config::{EngineConfig, LocalAccount};
pub use content::{
    CallMessage, CallMessageKind, Content, ContentHint, DataMessage, DecryptionErrorMessage,
    EditMessage, EnvelopeContent, Mention, NullMessage, ReceiptKind, ReceiptMessage,
    SentTranscript, SyncMessage, TypingAction, TypingMessage,
};
pub use engine::{DeliveryEngine, GroupAudience};
pub use error::{Error, Result, TransportError};
pub use events::{
    ChannelListener, DeliveryEvent, NoopEvents, PartialSendListener, SecurityEventListener,
    SendEvents,
};
pub use fanout::GroupMessage;
pub use retry::OutgoingMessage;
pub use sender_key_store::{InMemorySenderKeyStore, SenderKeyStore, StoredSenderKeyStore};
pub use session_store::{InMemorySessionStore, SessionStore};
pub use storage::{InMemoryStorage, StorageAdapter};
pub use transport::{GroupSendRequest, MessageTransport, TransportSelector};
pub use types::*;
