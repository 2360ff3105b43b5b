use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{RecipientIdentity, SenderCertificate, ServiceId};

/// Per-recipient sealed-sender credentials: a derived access key plus the
/// sender certificate the recipient will see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndividualAccess {
    #[serde(with = "hex::serde")]
    pub access_key: Vec<u8>,
    pub certificate: SenderCertificate,
    /// The recipient accepts sealed sends from anyone, but only for stories.
    #[serde(default)]
    pub unrestricted_for_story: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupSendToken(#[serde(with = "hex::serde")] pub Vec<u8>);

/// Group-send endorsements issued for one group: a combined token for the
/// whole membership plus per-member tokens for individual fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSendEndorsements {
    pub combined: Option<GroupSendToken>,
    pub members: HashMap<ServiceId, GroupSendToken>,
}

impl GroupSendEndorsements {
    pub fn for_individuals(&self, recipients: &[RecipientIdentity]) -> Vec<Option<GroupSendToken>> {
        recipients
            .iter()
            .map(|r| self.members.get(&r.service_id()).cloned())
            .collect()
    }
}

/// Access descriptor for one send. Downgrades only ever move towards `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SealedSenderAccess {
    #[default]
    None,
    Individual(IndividualAccess),
    GroupSend {
        token: GroupSendToken,
        certificate: SenderCertificate,
        fallback: Option<Box<SealedSenderAccess>>,
    },
}

impl SealedSenderAccess {
    pub fn individual(access: Option<IndividualAccess>) -> Self {
        match access {
            Some(access) => SealedSenderAccess::Individual(access),
            None => SealedSenderAccess::None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        !matches!(self, SealedSenderAccess::None)
    }

    pub fn certificate(&self) -> Option<&SenderCertificate> {
        match self {
            SealedSenderAccess::None => None,
            SealedSenderAccess::Individual(access) => Some(&access.certificate),
            SealedSenderAccess::GroupSend { certificate, .. } => Some(certificate),
        }
    }

    pub fn is_unrestricted_for_story(&self) -> bool {
        matches!(
            self,
            SealedSenderAccess::Individual(IndividualAccess {
                unrestricted_for_story: true,
                ..
            })
        )
    }

    /// The next weaker access. Individual access falls back to unsealed,
    /// a group-send token to its access-key fallback if one exists.
    pub fn switch_to_fallback(&self) -> SealedSenderAccess {
        match self {
            SealedSenderAccess::None | SealedSenderAccess::Individual(_) => {
                SealedSenderAccess::None
            }
            SealedSenderAccess::GroupSend { fallback, .. } => fallback
                .as_deref()
                .cloned()
                .unwrap_or(SealedSenderAccess::None),
        }
    }

    /// Access for a single sender-key send to the whole membership.
    ///
    /// Uses the combined endorsement token when available, falling back to
    /// the XOR of every member's access key. A sender-key send cannot go out
    /// unsealed, so missing credentials are an error.
    pub fn for_group_send(
        endorsements: Option<&GroupSendEndorsements>,
        accesses: &[Option<IndividualAccess>],
        story: bool,
    ) -> Result<SealedSenderAccess> {
        let certificate = accesses
            .iter()
            .flatten()
            .map(|a| a.certificate.clone())
            .next()
            .ok_or_else(|| {
                Error::InvalidArgument("group send needs a sender certificate".to_string())
            })?;

        let combined_key = combined_access_key(accesses)?;
        let key_access = combined_key.map(|access_key| {
            SealedSenderAccess::Individual(IndividualAccess {
                access_key,
                certificate: certificate.clone(),
                unrestricted_for_story: story,
            })
        });

        match endorsements.and_then(|e| e.combined.clone()) {
            Some(token) => Ok(SealedSenderAccess::GroupSend {
                token,
                certificate,
                fallback: key_access.map(Box::new),
            }),
            None => key_access.ok_or_else(|| {
                Error::InvalidArgument(
                    "group send needs endorsements or access keys for every member".to_string(),
                )
            }),
        }
    }

    /// Per-recipient access for fanning a message out individually to group
    /// members, e.g. sender-key distribution.
    pub fn for_fan_out_group_send(
        tokens: Option<Vec<Option<GroupSendToken>>>,
        certificate: Option<&SenderCertificate>,
        accesses: Vec<Option<IndividualAccess>>,
    ) -> Vec<SealedSenderAccess> {
        let mut tokens = tokens.unwrap_or_default().into_iter();
        accesses
            .into_iter()
            .map(|access| {
                let fallback = SealedSenderAccess::individual(access);
                match (tokens.next().flatten(), certificate) {
                    (Some(token), Some(certificate)) => SealedSenderAccess::GroupSend {
                        token,
                        certificate: certificate.clone(),
                        fallback: fallback.is_sealed().then(|| Box::new(fallback)),
                    },
                    _ => fallback,
                }
            })
            .collect()
    }
}

/// XOR of all members' access keys, or `None` if any member has no access.
fn combined_access_key(accesses: &[Option<IndividualAccess>]) -> Result<Option<Vec<u8>>> {
    let mut combined: Option<Vec<u8>> = None;
    for access in accesses {
        let Some(access) = access else {
            return Ok(None);
        };
        match combined.as_mut() {
            None => combined = Some(access.access_key.clone()),
            Some(acc) => {
                if acc.len() != access.access_key.len() {
                    return Err(Error::InvalidArgument(
                        "access keys differ in length".to_string(),
                    ));
                }
                for (a, b) in acc.iter_mut().zip(&access.access_key) {
                    *a ^= b;
                }
            }
        }
    }
    Ok(combined)
}
