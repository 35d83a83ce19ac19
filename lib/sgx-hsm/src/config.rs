//! Token and key configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::HsmError;

pub const DEFAULT_TOKEN_LABEL: &str = "HSMSDSServer";
pub const DEFAULT_KEY_LABEL: &str = "default";
pub const DEFAULT_SO_PIN: &str = "HSMSoPin";
pub const DEFAULT_USER_PIN: &str = "HSMUserPin";
pub const DEFAULT_KEY_TYPE: &str = "rsa";

/// Token, pin and key settings for an [`SgxContext`](crate::SgxContext).
///
/// Pins are scrubbed when the value is dropped and never appear in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub token_label: String,
    #[serde(default)]
    pub user_pin: String,
    #[serde(default)]
    pub so_pin: String,
    #[serde(default)]
    pub key_label: String,
    #[serde(default)]
    pub key_type: String,
    #[serde(default)]
    pub config_path: String,
}

impl Config {
    /// Replace every empty required field with its default.
    ///
    /// Never fails; each substitution is logged as a warning.
    pub fn validate(&mut self) {
        if self.token_label.is_empty() {
            warn!("Missing HSM token label, using {}", DEFAULT_TOKEN_LABEL);
            self.token_label = DEFAULT_TOKEN_LABEL.to_string();
        }

        if self.so_pin.is_empty() {
            warn!("Missing HSM SO pin, using default");
            self.so_pin = DEFAULT_SO_PIN.to_string();
        }

        if self.user_pin.is_empty() {
            warn!("Missing HSM user pin, using default");
            self.user_pin = DEFAULT_USER_PIN.to_string();
        }

        if self.key_type.is_empty() {
            warn!("Missing HSM key type, using {}", DEFAULT_KEY_TYPE);
            self.key_type = DEFAULT_KEY_TYPE.to_string();
        }
    }

    pub fn validated(mut self) -> Self {
        self.validate();
        self
    }

    /// Load a JSON config file. Missing fields stay empty until [`Config::validate`].
    pub fn load(path: &Path) -> Result<Self, HsmError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HsmError::InternalError(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let mut config: Config = serde_json::from_str(&contents).map_err(|e| {
            HsmError::InternalError(format!("Failed to parse config {}: {}", path.display(), e))
        })?;
        config.config_path = path.display().to_string();
        Ok(config)
    }

    /// The configured key label, falling back to [`DEFAULT_KEY_LABEL`].
    pub fn key_label_or_default(&self) -> &str {
        if self.key_label.is_empty() {
            DEFAULT_KEY_LABEL
        } else {
            &self.key_label
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("token_label", &self.token_label)
            .field("user_pin", &"<redacted>")
            .field("so_pin", &"<redacted>")
            .field("key_label", &self.key_label)
            .field("key_type", &self.key_type)
            .field("config_path", &self.config_path)
            .finish()
    }
}
