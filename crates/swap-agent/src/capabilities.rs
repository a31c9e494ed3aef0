//! Capability negotiation

use crate::error::CapabilityError;
use crate::host::{Capabilities, HostRuntime};

/// What every attach needs: redefinition for the swap itself, retransform and
/// load events for the one-time hook.
pub const REQUIRED_CAPABILITIES: Capabilities = Capabilities {
    redefine_classes: true,
    retransform_classes: true,
    all_class_hook_events: true,
    redefine_any_class: true,
};

/// Acquire [`REQUIRED_CAPABILITIES`], failing fast if the host cannot grant them.
///
/// Capabilities are per agent environment, so this runs on every attach.
pub fn negotiate(host: &dyn HostRuntime) -> Result<Capabilities, CapabilityError> {
    let potential = host.potential_capabilities();
    let missing = REQUIRED_CAPABILITIES.missing_from(&potential);
    if !missing.is_empty() {
        return Err(CapabilityError::Missing { missing });
    }

    host.add_capabilities(&REQUIRED_CAPABILITIES)
        .map_err(CapabilityError::Rejected)?;
    tracing::debug!("capabilities granted");
    Ok(REQUIRED_CAPABILITIES)
}
