//! Test utilities

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use message_delivery::{
    Content, ContentHint, DataMessage, DeliveryEngine, DeviceAddress, DistributionId,
    EngineConfig, EnvelopeContent, EnvelopeType, Error, GroupSendRequest, IdentityKey,
    InMemorySenderKeyStore, InMemorySessionStore, IndividualAccess, LocalAccount,
    MessageTransport, OutgoingPushMessage, OutgoingPushMessageList, PreKeyBundle,
    RecipientIdentity, Result, SealedSenderAccess, SendGroupMessageResponse, SendMessageResponse,
    SenderCertificate, SenderKeyDistributionMessage, ServiceId, SessionCipher, SessionStore,
    TransportError, TransportSelector,
};
use message_delivery::{NoopEvents, SecurityEventListener, SendEvents};
use tokio::runtime::Handle;

type Reply<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub list: OutgoingPushMessageList,
    pub access: SealedSenderAccess,
    pub story: bool,
}

#[derive(Debug, Clone)]
pub struct PreKeyRequest {
    pub recipient: RecipientIdentity,
    pub device_id: u32,
    pub access: SealedSenderAccess,
}

/// A transport that replays scripted replies and records every call.
/// Once a script runs dry, calls succeed.
#[derive(Default)]
pub struct MockTransport {
    send_script: Mutex<VecDeque<Reply<SendMessageResponse>>>,
    group_script: Mutex<VecDeque<Reply<SendGroupMessageResponse>>>,
    prekey_script: Mutex<VecDeque<Reply<Vec<PreKeyBundle>>>>,
    failing_destinations: Mutex<HashMap<String, TransportError>>,
    failing_sends: Mutex<Option<TransportError>>,
    needs_sync: Mutex<bool>,
    sent: Mutex<Vec<SentMessage>>,
    group_sent: Mutex<Vec<(GroupSendRequest, SealedSenderAccess)>>,
    prekey_requests: Mutex<Vec<PreKeyRequest>>,
    cancels: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_send(&self, reply: Reply<SendMessageResponse>) {
        self.send_script.lock().unwrap().push_back(reply);
    }

    pub fn push_group(&self, reply: Reply<SendGroupMessageResponse>) {
        self.group_script.lock().unwrap().push_back(reply);
    }

    pub fn push_pre_keys(&self, reply: Reply<Vec<PreKeyBundle>>) {
        self.prekey_script.lock().unwrap().push_back(reply);
    }

    /// Every 1:1 send to `recipient` fails with `error`.
    pub fn fail_destination(&self, recipient: &RecipientIdentity, error: TransportError) {
        self.failing_destinations
            .lock()
            .unwrap()
            .insert(recipient.identifier(), error);
    }

    /// Every 1:1 send and group send fails with `error`.
    pub fn fail_all_sends(&self, error: TransportError) {
        *self.failing_sends.lock().unwrap() = Some(error);
    }

    pub fn set_needs_sync(&self, needs_sync: bool) {
        *self.needs_sync.lock().unwrap() = needs_sync;
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, recipient: &RecipientIdentity) -> Vec<SentMessage> {
        let name = recipient.identifier();
        self.sent()
            .into_iter()
            .filter(|m| m.list.destination == name)
            .collect()
    }

    pub fn group_sent(&self) -> Vec<(GroupSendRequest, SealedSenderAccess)> {
        self.group_sent.lock().unwrap().clone()
    }

    pub fn prekey_requests(&self) -> Vec<PreKeyRequest> {
        self.prekey_requests.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.sent.lock().unwrap().len()
            + self.group_sent.lock().unwrap().len()
            + self.prekey_requests.lock().unwrap().len()
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    async fn send_message(
        &self,
        messages: &OutgoingPushMessageList,
        access: &SealedSenderAccess,
        story: bool,
    ) -> Reply<SendMessageResponse> {
        self.sent.lock().unwrap().push(SentMessage {
            list: messages.clone(),
            access: access.clone(),
            story,
        });

        if let Some(error) = self.failing_sends.lock().unwrap().clone() {
            return Err(error);
        }
        if let Some(error) = self
            .failing_destinations
            .lock()
            .unwrap()
            .get(&messages.destination)
            .cloned()
        {
            return Err(error);
        }
        if let Some(reply) = self.send_script.lock().unwrap().pop_front() {
            return reply.map(|r| SendMessageResponse {
                sent_unidentified: access.is_sealed(),
                ..r
            });
        }
        Ok(SendMessageResponse {
            needs_sync: *self.needs_sync.lock().unwrap(),
            sent_unidentified: access.is_sealed(),
        })
    }

    async fn send_group_message(
        &self,
        request: &GroupSendRequest,
        access: &SealedSenderAccess,
    ) -> Reply<SendGroupMessageResponse> {
        self.group_sent
            .lock()
            .unwrap()
            .push((request.clone(), access.clone()));

        if let Some(error) = self.failing_sends.lock().unwrap().clone() {
            return Err(error);
        }
        self.group_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SendGroupMessageResponse::default()))
    }

    async fn get_pre_keys(
        &self,
        recipient: &RecipientIdentity,
        access: &SealedSenderAccess,
        device_id: u32,
    ) -> Reply<Vec<PreKeyBundle>> {
        self.prekey_requests.lock().unwrap().push(PreKeyRequest {
            recipient: recipient.clone(),
            device_id,
            access: access.clone(),
        });

        self.prekey_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![bundle(device_id, b"session")]))
    }

    fn cancel_in_flight_requests(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn bundle(device_id: u32, payload: &[u8]) -> PreKeyBundle {
    PreKeyBundle {
        device_id,
        registration_id: 7,
        identity_key: IdentityKey(vec![device_id as u8; 4]),
        payload: payload.to_vec(),
    }
}

/// Session cipher over the in-memory session store. A bundle whose payload
/// is `bad` is rejected as an invalid key.
pub struct FakeCipher {
    sessions: Arc<InMemorySessionStore>,
    untrusted: Mutex<HashSet<String>>,
    distribution_messages: AtomicUsize,
}

impl FakeCipher {
    pub fn new(sessions: Arc<InMemorySessionStore>) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            untrusted: Mutex::new(HashSet::new()),
            distribution_messages: AtomicUsize::new(0),
        })
    }

    pub fn mark_untrusted(&self, recipient: &RecipientIdentity) {
        self.untrusted.lock().unwrap().insert(recipient.identifier());
    }

    pub fn distribution_messages(&self) -> usize {
        self.distribution_messages.load(Ordering::SeqCst)
    }
}

impl SessionCipher for FakeCipher {
    fn encrypt(
        &self,
        address: &DeviceAddress,
        access: &SealedSenderAccess,
        content: &EnvelopeContent,
    ) -> Result<OutgoingPushMessage> {
        if self.untrusted.lock().unwrap().contains(&address.name) {
            return Err(Error::UntrustedIdentity {
                name: address.name.clone(),
                identity_key: IdentityKey(vec![0xee; 4]),
            });
        }
        if !self.sessions.contains_session(address)? {
            return Err(Error::NoSession(address.clone()));
        }
        Ok(OutgoingPushMessage {
            kind: if access.is_sealed() {
                EnvelopeType::UnidentifiedSender
            } else {
                EnvelopeType::Ciphertext
            },
            destination_device_id: address.device_id,
            destination_registration_id: 7,
            content: content.to_bytes()?,
        })
    }

    fn process_pre_key_bundle(&self, address: &DeviceAddress, bundle: &PreKeyBundle) -> Result<()> {
        if bundle.payload == b"bad" {
            return Err(Error::InvalidKey("bad signed prekey".to_string()));
        }
        self.sessions
            .store_session(address.clone(), bundle.payload.clone())
    }

    fn encrypt_for_group(
        &self,
        _distribution_id: DistributionId,
        _destinations: &[DeviceAddress],
        _certificate: &SenderCertificate,
        content: &EnvelopeContent,
    ) -> Result<Vec<u8>> {
        content.to_bytes()
    }

    fn get_or_create_distribution_message(
        &self,
        _sender: &DeviceAddress,
        distribution_id: DistributionId,
    ) -> Result<SenderKeyDistributionMessage> {
        self.distribution_messages.fetch_add(1, Ordering::SeqCst);
        Ok(SenderKeyDistributionMessage(
            distribution_id.as_uuid().as_bytes().to_vec(),
        ))
    }
}

pub struct Harness {
    pub engine: DeliveryEngine,
    pub local: LocalAccount,
    pub sessions: Arc<InMemorySessionStore>,
    pub sender_keys: Arc<InMemorySenderKeyStore>,
    pub cipher: Arc<FakeCipher>,
    pub pipe: Option<Arc<MockTransport>>,
    pub rest: Arc<MockTransport>,
}

pub struct HarnessBuilder {
    config: EngineConfig,
    pipe: bool,
    events: Arc<dyn SendEvents>,
    security: Option<Arc<dyn SecurityEventListener>>,
}

impl HarnessBuilder {
    pub fn with_pipe(mut self) -> Self {
        self.pipe = true;
        self
    }

    pub fn max_envelope_size(mut self, max: usize) -> Self {
        self.config.max_envelope_size = max;
        self
    }

    pub fn listeners(
        mut self,
        events: Arc<dyn SendEvents>,
        security: Option<Arc<dyn SecurityEventListener>>,
    ) -> Self {
        self.events = events;
        self.security = security;
        self
    }

    pub fn build(self) -> Harness {
        let sessions = Arc::new(InMemorySessionStore::new());
        let sender_keys = Arc::new(InMemorySenderKeyStore::new());
        let cipher = FakeCipher::new(sessions.clone());
        let rest = MockTransport::new();
        let pipe = self.pipe.then(MockTransport::new);
        let transport = match &pipe {
            Some(pipe) => TransportSelector::new(
                Some(pipe.clone() as Arc<dyn MessageTransport>),
                rest.clone(),
            ),
            None => TransportSelector::rest_only(rest.clone()),
        };

        let engine = DeliveryEngine::new_with_listeners(
            self.config.clone(),
            sessions.clone(),
            Some(sender_keys.clone()),
            cipher.clone(),
            transport,
            Handle::current(),
            self.events,
            self.security,
        )
        .unwrap();

        Harness {
            engine,
            local: self.config.local,
            sessions,
            sender_keys,
            cipher,
            pipe,
            rest,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: EngineConfig::new(LocalAccount::new(ServiceId::random(), 2)),
            pipe: false,
            events: Arc::new(NoopEvents),
            security: None,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn me(&self) -> RecipientIdentity {
        self.local.identity()
    }

    pub fn pipe(&self) -> &MockTransport {
        self.pipe.as_deref().unwrap()
    }

    /// 1:1 sends to anyone but ourselves.
    pub fn sent_to_others(&self) -> usize {
        let me = self.me().identifier();
        self.rest
            .sent()
            .iter()
            .filter(|m| m.list.destination != me)
            .count()
    }
}

pub fn recipient() -> RecipientIdentity {
    RecipientIdentity::new(ServiceId::random())
}

pub fn access(key: u8) -> IndividualAccess {
    IndividualAccess {
        access_key: vec![key; 16],
        certificate: SenderCertificate(vec![0xce, 0x47]),
        unrestricted_for_story: false,
    }
}

pub fn text(timestamp: u64, body: &str) -> EnvelopeContent {
    EnvelopeContent::encrypted(
        Content::data(DataMessage::text(timestamp, body)),
        ContentHint::Resendable,
        None,
    )
}
