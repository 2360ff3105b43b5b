use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::{RecipientIdentity, ServiceId, DEFAULT_DEVICE_ID, DEFAULT_RETRY_COUNT};

/// The account this engine sends as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalAccount {
    pub service_id: ServiceId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e164: Option<String>,

    #[serde(default = "default_device_id")]
    pub device_id: u32,
}

impl LocalAccount {
    pub fn new(service_id: ServiceId, device_id: u32) -> Self {
        Self {
            service_id,
            e164: None,
            device_id,
        }
    }

    pub fn identity(&self) -> RecipientIdentity {
        match &self.e164 {
            Some(e164) => RecipientIdentity::with_e164(self.service_id, e164.clone()),
            None => RecipientIdentity::new(self.service_id),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub local: LocalAccount,

    /// Attempts per send before conflict resolution gives up
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Largest encoded content accepted, in bytes. 0 disables the check.
    #[serde(default = "default_max_envelope_size")]
    pub max_envelope_size: usize,

    /// Upper bound for random null-message padding, in bytes
    #[serde(default = "default_null_message_padding_max")]
    pub null_message_padding_max: usize,
}

fn default_device_id() -> u32 {
    DEFAULT_DEVICE_ID
}

fn default_retry_count() -> u32 {
    DEFAULT_RETRY_COUNT
}

fn default_max_envelope_size() -> usize {
    256 * 1024
}

fn default_null_message_padding_max() -> usize {
    140
}

impl EngineConfig {
    pub fn new(local: LocalAccount) -> Self {
        Self {
            local,
            retry_count: default_retry_count(),
            max_envelope_size: default_max_envelope_size(),
            null_message_padding_max: default_null_message_padding_max(),
        }
    }

    /// Load config from a JSON file. The local account has no sensible
    /// default, so a missing file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_count == 0 {
            return Err(Error::Config("retryCount must be at least 1".to_string()));
        }
        if self.local.device_id == 0 {
            return Err(Error::Config("local deviceId must be at least 1".to_string()));
        }
        Ok(())
    }
}
