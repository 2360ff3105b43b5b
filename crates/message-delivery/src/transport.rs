use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::access::SealedSenderAccess;
use crate::cancel::CancellationSignal;
use crate::error::TransportError;
use crate::types::{
    OutgoingPushMessageList, PreKeyBundle, RecipientIdentity, SendGroupMessageResponse,
    SendMessageResponse,
};
use crate::Result;

/// A sender-key ciphertext bound for every member of a group at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSendRequest {
    pub ciphertext: Vec<u8>,
    pub timestamp: u64,
    pub online: bool,
    pub urgent: bool,
    pub story: bool,
}

/// One way of reaching the server. The persistent channel and the REST
/// client implement the same calls with the same semantics.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send_message(
        &self,
        messages: &OutgoingPushMessageList,
        access: &SealedSenderAccess,
        story: bool,
    ) -> std::result::Result<SendMessageResponse, TransportError>;

    async fn send_group_message(
        &self,
        request: &GroupSendRequest,
        access: &SealedSenderAccess,
    ) -> std::result::Result<SendGroupMessageResponse, TransportError>;

    async fn get_pre_keys(
        &self,
        recipient: &RecipientIdentity,
        access: &SealedSenderAccess,
        device_id: u32,
    ) -> std::result::Result<Vec<PreKeyBundle>, TransportError>;

    /// Abort whatever the transport has in flight. Best effort.
    fn cancel_in_flight_requests(&self) {}
}

/// Tries the persistent channel first and repeats the same call over REST
/// when the channel is unavailable or fails at the transport level. Business
/// rejections from either side are returned as they are.
#[derive(Clone)]
pub struct TransportSelector {
    pipe: Option<Arc<dyn MessageTransport>>,
    rest: Arc<dyn MessageTransport>,
}

impl TransportSelector {
    pub fn new(pipe: Option<Arc<dyn MessageTransport>>, rest: Arc<dyn MessageTransport>) -> Self {
        Self { pipe, rest }
    }

    pub fn rest_only(rest: Arc<dyn MessageTransport>) -> Self {
        Self { pipe: None, rest }
    }

    pub async fn send_message(
        &self,
        messages: &OutgoingPushMessageList,
        access: &SealedSenderAccess,
        story: bool,
        cancel: &CancellationSignal,
    ) -> Result<SendMessageResponse> {
        if let Some(pipe) = &self.pipe {
            cancel.check()?;
            match pipe.send_message(messages, access, story).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transport_level() => {
                    log_fallback("send_message", messages.timestamp, access, &e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        cancel.check()?;
        Ok(self.rest.send_message(messages, access, story).await?)
    }

    pub async fn send_group_message(
        &self,
        request: &GroupSendRequest,
        access: &SealedSenderAccess,
        cancel: &CancellationSignal,
    ) -> Result<SendGroupMessageResponse> {
        if let Some(pipe) = &self.pipe {
            cancel.check()?;
            match pipe.send_group_message(request, access).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transport_level() => {
                    log_fallback("send_group_message", request.timestamp, access, &e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        cancel.check()?;
        Ok(self.rest.send_group_message(request, access).await?)
    }

    pub async fn get_pre_keys(
        &self,
        recipient: &RecipientIdentity,
        access: &SealedSenderAccess,
        device_id: u32,
        cancel: &CancellationSignal,
    ) -> Result<Vec<PreKeyBundle>> {
        if let Some(pipe) = &self.pipe {
            cancel.check()?;
            match pipe.get_pre_keys(recipient, access, device_id).await {
                Ok(bundles) => return Ok(bundles),
                Err(e) if e.is_transport_level() => {
                    info!(
                        recipient = %recipient,
                        device_id,
                        error = %e,
                        "prekey fetch over pipe failed, falling back"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        cancel.check()?;
        Ok(self.rest.get_pre_keys(recipient, access, device_id).await?)
    }

    pub fn cancel_in_flight_requests(&self) {
        if let Some(pipe) = &self.pipe {
            pipe.cancel_in_flight_requests();
        }
        self.rest.cancel_in_flight_requests();
    }
}

fn log_fallback(call: &str, timestamp: u64, access: &SealedSenderAccess, error: &TransportError) {
    let pipe = if access.is_sealed() {
        "unidentified pipe"
    } else {
        "pipe"
    };
    match error {
        TransportError::Unavailable(_) => {
            info!(call, timestamp, pipe, error = %error, "pipe unavailable, falling back to REST")
        }
        _ => warn!(call, timestamp, pipe, error = %error, "pipe failed, falling back to REST"),
    }
}
