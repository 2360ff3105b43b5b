use crate::access::SealedSenderAccess;
use crate::content::EnvelopeContent;
use crate::types::{
    DeviceAddress, DistributionId, OutgoingPushMessage, PreKeyBundle, SenderCertificate,
    SenderKeyDistributionMessage,
};
use crate::Result;

/// The session cipher the engine drives. Session storage sits behind it; the
/// engine only asks it to encrypt and to turn prekey bundles into sessions.
///
/// Implementations report an untrusted remote identity as
/// [`crate::Error::UntrustedIdentity`] and bad key material as
/// [`crate::Error::InvalidKey`].
pub trait SessionCipher: Send + Sync {
    /// Encrypt one envelope for one device that has a session.
    fn encrypt(
        &self,
        address: &DeviceAddress,
        access: &SealedSenderAccess,
        content: &EnvelopeContent,
    ) -> Result<OutgoingPushMessage>;

    /// Build a session for `address` from a fetched prekey bundle.
    fn process_pre_key_bundle(&self, address: &DeviceAddress, bundle: &PreKeyBundle) -> Result<()>;

    /// Encrypt a single sender-key ciphertext for every destination device.
    fn encrypt_for_group(
        &self,
        distribution_id: DistributionId,
        destinations: &[DeviceAddress],
        certificate: &SenderCertificate,
        content: &EnvelopeContent,
    ) -> Result<Vec<u8>>;

    /// Create the local sender-key session for a distribution if needed and
    /// return the message that hands its key to other devices.
    fn get_or_create_distribution_message(
        &self,
        sender: &DeviceAddress,
        distribution_id: DistributionId,
    ) -> Result<SenderKeyDistributionMessage>;
}
