//! Slot discovery, session opening and first-time token provisioning

use tracing::{debug, info};

use crate::config::Config;
use crate::device::Pkcs11Device;
use crate::error::HsmError;

/// Find the first slot whose token is labelled `token_label`.
pub fn find_slot<D: Pkcs11Device>(device: &D, token_label: &str) -> Result<D::Slot, HsmError> {
    let slots = device.slots_with_token()?;
    if slots.is_empty() {
        return Err(HsmError::TokenNotFound(format!(
            "{} (no slots available)",
            token_label
        )));
    }

    for slot in slots {
        let info = device.token_info(slot)?;
        if info.label == token_label {
            debug!(?slot, token_label, "Found token slot");
            return Ok(slot);
        }
    }

    Err(HsmError::TokenNotFound(token_label.to_string()))
}

/// Open a serial read/write session on `slot`.
pub fn open_session<D: Pkcs11Device>(device: &D, slot: D::Slot) -> Result<D::Session, HsmError> {
    device
        .open_rw_session(slot)
        .map_err(|e| HsmError::SessionOpen(e.to_string()))
}

/// Initialize the first uninitialized token with the configured label and pins.
pub fn initialize_token<D: Pkcs11Device>(device: &D, config: &Config) -> Result<(), HsmError> {
    let slots = device
        .slots_with_token()
        .map_err(|e| HsmError::TokenInit(e.to_string()))?;

    let mut target = None;
    for slot in slots {
        let info = device
            .token_info(slot)
            .map_err(|e| HsmError::TokenInit(e.to_string()))?;
        if !info.initialized {
            target = Some(slot);
            break;
        }
    }
    let slot = target.ok_or_else(|| {
        HsmError::TokenInit("no slot with an uninitialized token available".to_string())
    })?;

    info!(?slot, token_label = %config.token_label, "Initializing new token");
    device
        .init_token(slot, &config.token_label, &config.so_pin, &config.user_pin)
        .map_err(|e| HsmError::TokenInit(e.to_string()))
}
