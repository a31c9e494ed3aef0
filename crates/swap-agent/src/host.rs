//! Host runtime capability surface
//!
//! Everything the agent needs from the virtual machine it is attached to goes
//! through [`HostRuntime`]. The agent never assumes more than this trait
//! offers, which keeps the orchestration testable against the simulated host
//! in [`crate::test_harness`] and against mocks.

use crate::protocol::ChangeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Signature of a native method implementation registered with the host
///
/// The host passes itself back so the implementation can call further into
/// the runtime when it eventually runs.
pub type NativeFn = fn(&dyn HostRuntime, &[JValue]) -> JValue;

/// Optional runtime features the agent must be granted before doing any work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Replace the bytecode of loaded classes
    pub redefine_classes: bool,
    /// Request a fresh transformation pass over loaded classes
    pub retransform_classes: bool,
    /// Receive load events for every class, including bootstrap classes
    pub all_class_hook_events: bool,
    /// Redefine or retransform classes loaded by any loader
    pub redefine_any_class: bool,
}

impl Capabilities {
    /// Every capability set
    pub const ALL: Self = Self {
        redefine_classes: true,
        retransform_classes: true,
        all_class_hook_events: true,
        redefine_any_class: true,
    };

    /// No capability set
    pub const NONE: Self = Self {
        redefine_classes: false,
        retransform_classes: false,
        all_class_hook_events: false,
        redefine_any_class: false,
    };

    /// Names of capabilities set in `self` but absent from `available`
    #[must_use]
    pub fn missing_from(&self, available: &Self) -> Vec<&'static str> {
        let wanted = [
            ("redefine_classes", self.redefine_classes, available.redefine_classes),
            ("retransform_classes", self.retransform_classes, available.retransform_classes),
            (
                "all_class_hook_events",
                self.all_class_hook_events,
                available.all_class_hook_events,
            ),
            ("redefine_any_class", self.redefine_any_class, available.redefine_any_class),
        ];
        wanted
            .into_iter()
            .filter(|(_, want, have)| *want && !*have)
            .map(|(name, _, _)| name)
            .collect()
    }
}

/// Value crossing the managed/native boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JValue {
    Void,
    Bool(bool),
    Int(i32),
    Long(i64),
    Str(String),
}

impl JValue {
    /// Boolean payload, if this is a boolean
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Long payload, if this is a long
    #[must_use]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(l) => Some(*l),
            _ => None,
        }
    }
}

/// Name and type descriptor of a method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodSig {
    pub name: &'static str,
    pub signature: &'static str,
}

impl MethodSig {
    #[must_use]
    pub const fn new(name: &'static str, signature: &'static str) -> Self {
        Self { name, signature }
    }
}

impl fmt::Display for MethodSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.signature)
    }
}

/// One entry of the native binding table
#[derive(Debug, Clone, Copy)]
pub struct NativeBinding {
    pub class: &'static str,
    pub method: MethodSig,
    pub function: NativeFn,
}

impl NativeBinding {
    #[must_use]
    pub const fn new(class: &'static str, method: MethodSig, function: NativeFn) -> Self {
        Self {
            class,
            method,
            function,
        }
    }
}

/// Callback invoked by the host for each class file load while load
/// notification is enabled
pub trait ClassLoadHook: Send + Sync {
    /// Return replacement class bytes, or `None` to keep the original
    fn on_class_file_load(&self, class_name: &str, class_data: &[u8]) -> Option<Vec<u8>>;
}

/// Failure category reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostErrorCode {
    /// Capability or environment not available
    NotAvailable,
    /// Class could not be resolved
    ClassNotFound,
    /// Method could not be resolved
    MethodNotFound,
    /// New class bytes are malformed
    InvalidClassFormat,
    /// Change alters class shape (fields, methods, hierarchy)
    UnsupportedChange,
    /// Arguments were rejected
    IllegalArgument,
    /// Managed code threw
    Exception,
    /// Anything else
    Internal,
}

impl HostErrorCode {
    /// Stable name, used as the `kind` of reported error details
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotAvailable => "NOT_AVAILABLE",
            Self::ClassNotFound => "CLASS_NOT_FOUND",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidClassFormat => "INVALID_CLASS_FORMAT",
            Self::UnsupportedChange => "UNSUPPORTED_CHANGE",
            Self::IllegalArgument => "ILLEGAL_ARGUMENT",
            Self::Exception => "EXCEPTION",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for HostErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by the host runtime
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HostError {
    pub code: HostErrorCode,
    pub message: String,
}

impl HostError {
    #[must_use]
    pub fn new(code: HostErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The virtual machine the agent is attached to
///
/// Implementations must tolerate every method being called from the thread
/// that invoked the attach entry point. Native functions registered through
/// [`HostRuntime::register_natives`] may later be invoked from any thread the
/// host chooses.
#[cfg_attr(test, mockall::automock)]
pub trait HostRuntime {
    /// Capabilities this host could grant
    fn potential_capabilities(&self) -> Capabilities;

    /// Request capabilities for this agent environment
    fn add_capabilities(&self, capabilities: &Capabilities) -> Result<(), HostError>;

    /// Install (`Some`) or clear (`None`) the single class load callback
    fn set_load_hook(&self, hook: Option<Arc<dyn ClassLoadHook>>) -> Result<(), HostError>;

    /// Enable or disable class load notification process-wide
    fn set_load_notification(&self, enabled: bool) -> Result<(), HostError>;

    /// Force a transformation pass over one loaded class
    fn retransform_class(&self, class_name: &str) -> Result<(), HostError>;

    /// Replace loaded classes with new bytecode
    fn redefine_classes(&self, change_set: &ChangeSet) -> Result<(), HostError>;

    /// Whether `class_name` resolves in the shared class-visibility path
    ///
    /// A failed lookup leaves no pending exception behind.
    fn find_class(&self, class_name: &str) -> bool;

    /// Make an archive's classes resolvable from the bootstrap loader
    fn append_to_bootstrap_search(&self, archive: &Path) -> Result<(), HostError>;

    /// Invoke a static method
    fn call_static(
        &self,
        class_name: &str,
        method: &MethodSig,
        args: &[JValue],
    ) -> Result<JValue, HostError>;

    /// Bind native method implementations, replacing existing bindings
    fn register_natives(&self, bindings: &[NativeBinding]) -> Result<(), HostError>;

    /// Process id of the host
    fn process_id(&self) -> u32 {
        std::process::id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_from_lists_absent_capabilities() {
        let have = Capabilities {
            redefine_classes: true,
            ..Capabilities::NONE
        };
        assert_eq!(
            Capabilities::ALL.missing_from(&have),
            vec!["retransform_classes", "all_class_hook_events", "redefine_any_class"]
        );
        assert!(have.missing_from(&Capabilities::ALL).is_empty());
    }

    #[test]
    fn host_error_display_includes_code() {
        let err = HostError::new(HostErrorCode::UnsupportedChange, "field added");
        assert_eq!(err.to_string(), "UNSUPPORTED_CHANGE: field added");
    }

    #[test]
    fn method_sig_display() {
        assert_eq!(MethodSig::new("checkHash", "(Ljava/lang/String;)Z").to_string(), "checkHash(Ljava/lang/String;)Z");
    }
}
