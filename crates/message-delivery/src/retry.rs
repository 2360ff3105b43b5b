use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::access::SealedSenderAccess;
use crate::cancel::CancellationSignal;
use crate::content::EnvelopeContent;
use crate::encryptor::EnvelopeEncryptor;
use crate::error::TransportError;
use crate::events::{PartialSendListener, SendEvents};
use crate::reconciler::DeviceReconciler;
use crate::session_store::SessionStore;
use crate::transport::TransportSelector;
use crate::types::{
    MismatchedDevices, RecipientIdentity, SendMessageResult, SendOutcome, StaleDevices,
};
use crate::{Error, Result};

/// A logical message ready for the 1:1 send path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub timestamp: u64,
    pub content: EnvelopeContent,
    pub online: bool,
    pub urgent: bool,
    pub story: bool,
}

impl OutgoingMessage {
    pub fn new(timestamp: u64, content: EnvelopeContent) -> Self {
        Self {
            timestamp,
            content,
            online: false,
            urgent: false,
            story: false,
        }
    }

    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }

    pub fn story(mut self, story: bool) -> Self {
        self.story = story;
        self
    }
}

/// Failures that get a repair and another attempt.
#[derive(Debug)]
enum Recoverable {
    InvalidKey(String),
    SealedAuthorization,
    MismatchedDevices(MismatchedDevices),
    StaleDevices(StaleDevices),
    Network(TransportError),
}

fn classify(error: Error, sealed: bool) -> std::result::Result<Recoverable, Error> {
    match error {
        Error::InvalidKey(reason) => Ok(Recoverable::InvalidKey(reason)),
        Error::Transport(TransportError::AuthorizationFailed) if sealed => {
            Ok(Recoverable::SealedAuthorization)
        }
        Error::Transport(TransportError::MismatchedDevices(m)) => {
            Ok(Recoverable::MismatchedDevices(m))
        }
        Error::Transport(TransportError::StaleDevices(s)) => Ok(Recoverable::StaleDevices(s)),
        Error::Transport(e) if e.is_transport_level() => Ok(Recoverable::Network(e)),
        other => Err(other),
    }
}

/// Map a terminal error to the per-recipient result it stands for. Errors
/// no result variant describes are handed back.
pub fn result_for_error(recipient: &RecipientIdentity, error: Error) -> Result<SendMessageResult> {
    let failed = |outcome| SendMessageResult {
        address: recipient.clone(),
        outcome,
    };
    let result = match error {
        Error::UntrustedIdentity { identity_key, .. } => {
            SendMessageResult::identity_failure(recipient.clone(), identity_key)
        }
        Error::Transport(TransportError::Unregistered | TransportError::NotFound) => {
            SendMessageResult::unregistered_failure(recipient.clone())
        }
        Error::Transport(e) if e.is_transport_level() => {
            SendMessageResult::network_failure(recipient.clone())
        }
        Error::Transport(TransportError::RateLimited { retry_after }) => {
            failed(SendOutcome::RateLimitFailure { retry_after })
        }
        Error::Transport(TransportError::ProofRequired { token, options }) => {
            failed(SendOutcome::ProofRequiredFailure { token, options })
        }
        Error::InvalidPreKey(_) => failed(SendOutcome::InvalidPreKeyFailure),
        other => return Err(other),
    };
    warn!(recipient = %recipient, outcome = ?result.outcome, "send failed");
    Ok(result)
}

/// Like [`result_for_error`], but running out of attempts is just a network
/// failure for that recipient.
fn fan_out_result_for_error(
    recipient: &RecipientIdentity,
    error: Error,
) -> Result<SendMessageResult> {
    match error {
        Error::RetriesExhausted { attempts } => {
            warn!(recipient = %recipient, attempts, "giving up on recipient");
            Ok(SendMessageResult::network_failure(recipient.clone()))
        }
        other => result_for_error(recipient, other),
    }
}

/// Drives encrypt, transmit, classify and repair for 1:1 sends, bounded by
/// the retry budget.
#[derive(Clone)]
pub struct RetryCoordinator {
    retry_count: u32,
    sessions: Arc<dyn SessionStore>,
    encryptor: EnvelopeEncryptor,
    reconciler: DeviceReconciler,
    transport: TransportSelector,
    runtime: Handle,
}

impl RetryCoordinator {
    pub fn new(
        retry_count: u32,
        sessions: Arc<dyn SessionStore>,
        encryptor: EnvelopeEncryptor,
        reconciler: DeviceReconciler,
        transport: TransportSelector,
        runtime: Handle,
    ) -> Self {
        Self {
            retry_count,
            sessions,
            encryptor,
            reconciler,
            transport,
            runtime,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Send to one recipient. Anything short of success is an error here;
    /// see [`RetryCoordinator::send_to_one`] for the result-mapped form.
    pub async fn send(
        &self,
        recipient: &RecipientIdentity,
        access: SealedSenderAccess,
        message: &OutgoingMessage,
        events: Option<&dyn SendEvents>,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        let start = Instant::now();
        let mut access = access;

        for attempt in 0..self.retry_count {
            cancel.check()?;

            let error = match self
                .attempt(recipient, &access, message, start, attempt == 0, events, cancel)
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            match classify(error, access.is_sealed()) {
                Err(fatal) => return Err(fatal),
                Ok(reason) => {
                    self.repair(recipient, reason, &mut access, message.timestamp, cancel)
                        .await?
                }
            }
            warn!(
                timestamp = message.timestamp,
                recipient = %recipient,
                attempt,
                "send attempt failed"
            );
        }

        warn!(
            timestamp = message.timestamp,
            recipient = %recipient,
            attempts = self.retry_count,
            "failed to resolve conflicts"
        );
        Err(Error::RetriesExhausted {
            attempts: self.retry_count,
        })
    }

    /// Send to one recipient, returning classified failures as results.
    pub async fn send_to_one(
        &self,
        recipient: &RecipientIdentity,
        access: SealedSenderAccess,
        message: &OutgoingMessage,
        events: Option<&dyn SendEvents>,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        match self.send(recipient, access, message, events, cancel).await {
            Ok(result) => Ok(result),
            Err(e) => result_for_error(recipient, e),
        }
    }

    /// Run one independent pipeline per recipient and wait for all of them.
    /// Results come back in completion order.
    ///
    /// Recipients whose pipeline ended in an error no result describes are
    /// reported together in [`Error::FanOut`], alongside everyone else's
    /// result.
    pub async fn send_to_many(
        &self,
        recipients: &[RecipientIdentity],
        accesses: Vec<SealedSenderAccess>,
        message: OutgoingMessage,
        partial: Option<Arc<dyn PartialSendListener>>,
        cancel: &CancellationSignal,
    ) -> Result<Vec<SendMessageResult>> {
        if recipients.len() != accesses.len() {
            return Err(Error::InvalidArgument(format!(
                "{} recipients but {} access entries",
                recipients.len(),
                accesses.len()
            )));
        }

        let start = Instant::now();
        let message = Arc::new(message);
        let mut pending = FuturesUnordered::new();

        for (recipient, access) in recipients.iter().cloned().zip(accesses) {
            let this = self.clone();
            let message = message.clone();
            let partial = partial.clone();
            let cancel = cancel.clone();
            let task_recipient = recipient.clone();
            let handle = self.runtime.spawn(async move {
                let recipient = task_recipient;
                let result = match this.send(&recipient, access, &message, None, &cancel).await {
                    Ok(result) => Ok(result),
                    Err(e) => fan_out_result_for_error(&recipient, e),
                };
                if let (Ok(result), Some(listener)) = (&result, &partial) {
                    listener.on_partial_send_complete(std::slice::from_ref(result));
                }
                result
            });
            pending.push(async move { (recipient, handle.await) });
        }

        let mut results = Vec::with_capacity(recipients.len());
        let mut errors = Vec::new();
        while let Some((recipient, joined)) = pending.next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => errors.push((recipient, e)),
                Err(e) => errors.push((recipient, Error::Task(e.to_string()))),
            }
        }

        log_fan_out_stats(message.timestamp, &results, start.elapsed());
        settle_fan_out(results, errors)
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        recipient: &RecipientIdentity,
        access: &SealedSenderAccess,
        message: &OutgoingMessage,
        start: Instant,
        first: bool,
        events: Option<&dyn SendEvents>,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResult> {
        let messages = self
            .encryptor
            .encrypt_for_recipient(
                recipient,
                access,
                message.timestamp,
                &message.content,
                message.online,
                message.urgent,
                message.story,
                cancel,
            )
            .await?;

        if first {
            if let Some(events) = events {
                events.on_message_encrypted();
            }
        }

        let response = self
            .transport
            .send_message(&messages, access, message.story, cancel)
            .await?;

        let needs_sync = response.needs_sync || self.sessions.is_multi_device()?;
        debug!(
            timestamp = message.timestamp,
            recipient = %recipient,
            devices = ?messages.devices(),
            unidentified = response.sent_unidentified,
            "sent"
        );
        Ok(SendMessageResult::success(
            recipient.clone(),
            messages.devices(),
            response.sent_unidentified,
            needs_sync,
            Some(start.elapsed()),
        ))
    }

    async fn repair(
        &self,
        recipient: &RecipientIdentity,
        reason: Recoverable,
        access: &mut SealedSenderAccess,
        timestamp: u64,
        cancel: &CancellationSignal,
    ) -> Result<()> {
        match reason {
            Recoverable::InvalidKey(reason) => {
                warn!(
                    timestamp,
                    recipient = %recipient,
                    reason,
                    "invalid key, dropping sealed sender"
                );
                *access = access.switch_to_fallback();
            }
            Recoverable::SealedAuthorization => {
                warn!(
                    timestamp,
                    recipient = %recipient,
                    "sealed sender authorization failed, falling back"
                );
                *access = access.switch_to_fallback();
            }
            Recoverable::MismatchedDevices(mismatched) => {
                self.reconciler
                    .handle_mismatched(recipient, &mismatched, cancel)
                    .await?;
            }
            Recoverable::StaleDevices(stale) => {
                self.reconciler.handle_stale(recipient, &stale)?;
            }
            Recoverable::Network(error) => {
                warn!(timestamp, recipient = %recipient, error = %error, "both transports failed");
            }
        }
        Ok(())
    }
}

fn settle_fan_out(
    results: Vec<SendMessageResult>,
    errors: Vec<(RecipientIdentity, Error)>,
) -> Result<Vec<SendMessageResult>> {
    if errors.is_empty() {
        return Ok(results);
    }
    if results.is_empty() && errors.iter().all(|(_, e)| matches!(e, Error::Canceled)) {
        return Err(Error::Canceled);
    }
    for (recipient, error) in &errors {
        warn!(recipient = %recipient, error = %error, "fan-out send failed");
    }
    Err(Error::FanOut { results, errors })
}

fn log_fan_out_stats(timestamp: u64, results: &[SendMessageResult], total: Duration) {
    let durations: Vec<Duration> = results
        .iter()
        .filter_map(|r| r.success_details().and_then(|s| s.duration))
        .collect();
    let average_ms = if durations.is_empty() {
        0
    } else {
        durations.iter().sum::<Duration>().as_millis() / durations.len() as u128
    };
    debug!(
        timestamp,
        recipients = results.len(),
        total_ms = total.as_millis() as u64,
        average_ms = average_ms as u64,
        "completed fan-out send"
    );
}
