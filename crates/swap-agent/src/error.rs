//! Error types for the attach agent
//!
//! Every variant of [`AttachError`] is fatal to the session and produces no
//! response frame. The one application-level failure, a rejected
//! redefinition, is a [`SwapError`] and is reported to the controller as a
//! `ERROR` response instead.

use crate::host::HostError;
use crate::protocol::DecodeError;
use crate::state_machine::SessionState;
use crate::transport::TransportError;
use std::fmt;
use std::path::PathBuf;
use swap_payload::{Fingerprint, StoreError};

/// Fatal session error
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// Connect, read or write failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Request bytes were malformed
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Required capabilities unavailable
    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// Payload could not be written or made visible
    #[error("install error: {0}")]
    Install(#[from] InstallError),

    /// A different payload build already occupies the process
    #[error("version mismatch: {0}")]
    VersionMismatch(#[from] VersionMismatchError),

    /// One-time hook installation failed
    #[error("instrumentation error: {0}")]
    Instrumentation(#[from] InstrumentationError),

    /// Deferred swap could not be handed to the host
    #[error("handoff error: {0}")]
    Handoff(#[from] HandoffError),

    /// Session attempted an illegal transition
    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),
}

impl AttachError {
    /// Taxonomy bucket of this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Capability(_) => ErrorKind::Capability,
            Self::Install(_) => ErrorKind::Install,
            Self::VersionMismatch(_) => ErrorKind::VersionMismatch,
            Self::Instrumentation(_) => ErrorKind::Instrumentation,
            Self::Handoff(_) => ErrorKind::Handoff,
            Self::StateMachine(_) => ErrorKind::Internal,
        }
    }

    /// Whether the only recovery is restarting the target process
    #[must_use]
    pub const fn is_restart_required(&self) -> bool {
        matches!(self, Self::VersionMismatch(_))
    }
}

/// Taxonomy of fatal session errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Decode,
    Capability,
    Install,
    VersionMismatch,
    Instrumentation,
    Handoff,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Capability negotiation errors
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    /// Host cannot grant some required capabilities
    #[error("host lacks capabilities: {}", missing.join(", "))]
    Missing { missing: Vec<&'static str> },

    /// Host refused the request
    #[error("host rejected capabilities: {0}")]
    Rejected(HostError),
}

/// Payload installation errors
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// Package name does not map to a directory under the payload root
    #[error("no payload directory for package {0:?}")]
    PayloadDir(String),

    /// Payload could not be written to disk
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Host would not add the payload to the bootstrap search path
    #[error("cannot inject {}: {source}", path.display())]
    Inject { path: PathBuf, source: HostError },

    /// Payload was injected but its marker still does not resolve
    #[error("marker {class} not resolvable after injecting {}", path.display())]
    MarkerUnresolvable { class: &'static str, path: PathBuf },
}

/// Resident payload differs from this build
#[derive(Debug, thiserror::Error)]
pub enum VersionMismatchError {
    /// Marker reports a different fingerprint
    #[error("resident payload is not build {build}; the application must be restarted")]
    Mismatch { build: Fingerprint },

    /// Marker could not be asked; treated as foreign
    #[error("cannot verify resident payload against build {build}: {source}")]
    Unverifiable { build: Fingerprint, source: HostError },
}

/// One-time instrumentation errors
#[derive(Debug, thiserror::Error)]
pub enum InstrumentationError {
    /// Hook target class is not loaded
    #[error("hook target {0} not found")]
    TargetNotFound(String),

    /// Load callback could not be installed
    #[error("cannot install load hook: {0}")]
    LoadHook(HostError),

    /// Load notification could not be enabled
    #[error("cannot enable load notification: {0}")]
    Notification(HostError),

    /// Host rejected the retransform
    #[error("retransform of {class} failed: {source}")]
    Retransform { class: String, source: HostError },

    /// Marker could not be read or updated
    #[error("marker call failed: {0}")]
    Marker(HostError),
}

/// Restart handoff errors
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// Native bindings could not be registered
    #[error("cannot register native bindings: {0}")]
    RegisterNatives(HostError),

    /// Host refused to take the pending swap
    #[error("cannot hand off pending swap: {0}")]
    Transfer(HostError),
}

/// Host rejected a redefinition; reported to the controller, never retried
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("swap rejected: {0}")]
pub struct SwapError(pub HostError);

/// Session state machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: SessionState, to: SessionState },
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file malformed
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Value out of range
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}
