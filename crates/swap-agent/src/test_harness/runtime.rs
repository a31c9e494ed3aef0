//! In-process stand-in for the host virtual machine
//!
//! Models just enough of the runtime for whole attach sessions to run:
//! capabilities, loaded classes and their bytes, bootstrap search entries,
//! the marker class that appears once the payload is injected, the load hook
//! and notification switch, class redefinition, and the native binding table.
//! Every [`HostRuntime`] call is counted so tests can assert that nothing
//! touched the host.

use crate::handoff::{HANDLER_WRAPPER_CLASS, PREPARE_FOR_HOT_SWAP, TRY_REDEFINE_CLASSES};
use crate::host::{
    Capabilities, ClassLoadHook, HostError, HostErrorCode, HostRuntime, JValue, MethodSig,
    NativeBinding, NativeFn,
};
use crate::instrument::HOOK_TARGET_CLASS;
use crate::marker::{CHECK_FINGERPRINT, IS_INSTRUMENTED, MARKER_CLASS, MARK_INSTRUMENTED};
use crate::protocol::ChangeSet;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Pid of the first simulated process; later ones count up from here
pub const FIRST_PID: u32 = 4242;

static NEXT_PID: AtomicU32 = AtomicU32::new(FIRST_PID);

type NativeKey = (&'static str, MethodSig);

struct HostState {
    potential: Capabilities,
    granted: Capabilities,
    classes: HashMap<String, Vec<u8>>,
    incompatible: HashSet<String>,
    bootstrap: Vec<PathBuf>,
    resident_fingerprint: Option<String>,
    instrumented: bool,
    hooked: bool,
    load_hook: Option<Arc<dyn ClassLoadHook>>,
    notification: bool,
    retransforms: HashMap<String, usize>,
    redefinitions: usize,
    natives: HashMap<NativeKey, NativeFn>,
    pending_token: Option<i64>,
    calls: usize,
}

/// Simulated host runtime
pub struct SimulatedHost {
    pid: u32,
    state: Mutex<HostState>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    /// Host granting every capability, with the hook target class loaded
    ///
    /// Each simulated process gets its own pid.
    #[must_use]
    pub fn new() -> Self {
        let mut classes = HashMap::new();
        classes.insert(HOOK_TARGET_CLASS.to_string(), b"ActivityThread$H".to_vec());
        Self {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(HostState {
                potential: Capabilities::ALL,
                granted: Capabilities::NONE,
                classes,
                incompatible: HashSet::new(),
                bootstrap: Vec::new(),
                resident_fingerprint: None,
                instrumented: false,
                hooked: false,
                load_hook: None,
                notification: false,
                retransforms: HashMap::new(),
                redefinitions: 0,
                natives: HashMap::new(),
                pending_token: None,
                calls: 0,
            }),
        }
    }

    /// Limit what the host can grant
    #[must_use]
    pub fn with_capabilities(self, potential: Capabilities) -> Self {
        self.state.lock().potential = potential;
        self
    }

    /// Load an application class
    #[must_use]
    pub fn with_class(self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.state.lock().classes.insert(name.into(), bytes.into());
        self
    }

    /// Make redefinitions of `name` fail as a shape change
    #[must_use]
    pub fn with_incompatible_class(self, name: impl Into<String>) -> Self {
        self.state.lock().incompatible.insert(name.into());
        self
    }

    /// Bind a native directly, as an earlier agent image would have
    pub fn seed_native(&self, class: &'static str, method: MethodSig, function: NativeFn) {
        self.state.lock().natives.insert((class, method), function);
    }

    /// Invoke a bound native the way managed code would
    ///
    /// Returns `None` if nothing is bound.
    pub fn invoke_native(&self, class: &'static str, method: MethodSig, args: &[JValue]) -> Option<JValue> {
        let function = *self.state.lock().natives.get(&(class, method))?;
        Some(function(self, args))
    }

    /// Reach the activity restart boundary
    ///
    /// The hooked handler passes its pending token to `tryRedefineClasses`.
    /// Returns that native's answer, or `None` if no swap was handed over or
    /// nothing is bound.
    pub fn signal_restart(&self) -> Option<bool> {
        let token = {
            let mut state = self.state.lock();
            if !state.hooked {
                return None;
            }
            state.pending_token.take()?
        };
        self.invoke_native(HANDLER_WRAPPER_CLASS, TRY_REDEFINE_CLASSES, &[JValue::Long(token)])?
            .as_bool()
    }

    /// Total [`HostRuntime`] calls, excluding `process_id`
    #[must_use]
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    #[must_use]
    pub fn retransform_count(&self, class_name: &str) -> usize {
        self.state.lock().retransforms.get(class_name).copied().unwrap_or(0)
    }

    /// Successful redefinitions
    #[must_use]
    pub fn redefinitions(&self) -> usize {
        self.state.lock().redefinitions
    }

    #[must_use]
    pub fn class_bytes(&self, class_name: &str) -> Option<Vec<u8>> {
        self.state.lock().classes.get(class_name).cloned()
    }

    #[must_use]
    pub fn bootstrap_archives(&self) -> Vec<PathBuf> {
        self.state.lock().bootstrap.clone()
    }

    /// Fingerprint recorded by the marker, once a payload claimed the process
    #[must_use]
    pub fn resident_fingerprint(&self) -> Option<String> {
        self.state.lock().resident_fingerprint.clone()
    }

    #[must_use]
    pub fn is_instrumented(&self) -> bool {
        self.state.lock().instrumented
    }

    #[must_use]
    pub fn notification_enabled(&self) -> bool {
        self.state.lock().notification
    }

    #[must_use]
    pub fn has_load_hook(&self) -> bool {
        self.state.lock().load_hook.is_some()
    }

    #[must_use]
    pub fn granted(&self) -> Capabilities {
        self.state.lock().granted
    }

    #[must_use]
    pub fn pending_token(&self) -> Option<i64> {
        self.state.lock().pending_token
    }

    fn enter(&self) -> parking_lot::MutexGuard<'_, HostState> {
        let mut state = self.state.lock();
        state.calls += 1;
        state
    }
}

fn not_granted(what: &str) -> HostError {
    HostError::new(HostErrorCode::NotAvailable, format!("{what} capability not granted"))
}

fn class_not_found(name: &str) -> HostError {
    HostError::new(HostErrorCode::ClassNotFound, name.to_string())
}

impl HostRuntime for SimulatedHost {
    fn potential_capabilities(&self) -> Capabilities {
        self.enter().potential
    }

    fn add_capabilities(&self, capabilities: &Capabilities) -> Result<(), HostError> {
        let mut state = self.enter();
        let missing = capabilities.missing_from(&state.potential);
        if !missing.is_empty() {
            return Err(HostError::new(
                HostErrorCode::NotAvailable,
                format!("cannot grant {}", missing.join(", ")),
            ));
        }
        let granted = state.granted;
        state.granted = Capabilities {
            redefine_classes: granted.redefine_classes || capabilities.redefine_classes,
            retransform_classes: granted.retransform_classes || capabilities.retransform_classes,
            all_class_hook_events: granted.all_class_hook_events
                || capabilities.all_class_hook_events,
            redefine_any_class: granted.redefine_any_class || capabilities.redefine_any_class,
        };
        Ok(())
    }

    fn set_load_hook(&self, hook: Option<Arc<dyn ClassLoadHook>>) -> Result<(), HostError> {
        self.enter().load_hook = hook;
        Ok(())
    }

    fn set_load_notification(&self, enabled: bool) -> Result<(), HostError> {
        self.enter().notification = enabled;
        Ok(())
    }

    fn retransform_class(&self, class_name: &str) -> Result<(), HostError> {
        let (hook, bytes) = {
            let mut state = self.enter();
            if !state.granted.retransform_classes {
                return Err(not_granted("retransform"));
            }
            let bytes = state
                .classes
                .get(class_name)
                .cloned()
                .ok_or_else(|| class_not_found(class_name))?;
            *state.retransforms.entry(class_name.to_string()).or_insert(0) += 1;
            let hook = if state.notification {
                state.load_hook.clone()
            } else {
                None
            };
            (hook, bytes)
        };

        // The hook runs without the host lock held.
        let Some(rewritten) = hook.and_then(|h| h.on_class_file_load(class_name, &bytes)) else {
            return Ok(());
        };
        let mut state = self.state.lock();
        if class_name == HOOK_TARGET_CLASS {
            state.hooked = true;
        }
        state.classes.insert(class_name.to_string(), rewritten);
        Ok(())
    }

    fn redefine_classes(&self, change_set: &ChangeSet) -> Result<(), HostError> {
        let mut state = self.enter();
        if !state.granted.redefine_classes {
            return Err(not_granted("redefine"));
        }
        for class in &change_set.classes {
            if !state.classes.contains_key(&class.name) {
                return Err(class_not_found(&class.name));
            }
            if class.bytecode.is_empty() {
                return Err(HostError::new(
                    HostErrorCode::InvalidClassFormat,
                    format!("{} has no bytecode", class.name),
                ));
            }
            if state.incompatible.contains(&class.name) {
                return Err(HostError::new(
                    HostErrorCode::UnsupportedChange,
                    format!("{} changes class shape", class.name),
                ));
            }
        }
        for class in &change_set.classes {
            state.classes.insert(class.name.clone(), class.bytecode.clone());
        }
        state.redefinitions += 1;
        Ok(())
    }

    fn find_class(&self, class_name: &str) -> bool {
        self.enter().classes.contains_key(class_name)
    }

    fn append_to_bootstrap_search(&self, archive: &Path) -> Result<(), HostError> {
        let mut state = self.enter();
        if !archive.is_file() {
            return Err(HostError::new(
                HostErrorCode::IllegalArgument,
                format!("{} is not a readable archive", archive.display()),
            ));
        }
        state.bootstrap.push(archive.to_path_buf());
        for class in [MARKER_CLASS, HANDLER_WRAPPER_CLASS] {
            state.classes.entry(class.to_string()).or_default();
        }
        Ok(())
    }

    fn call_static(
        &self,
        class_name: &str,
        method: &MethodSig,
        args: &[JValue],
    ) -> Result<JValue, HostError> {
        let mut state = self.enter();
        if !state.classes.contains_key(class_name) {
            return Err(class_not_found(class_name));
        }

        match (class_name, *method) {
            (MARKER_CLASS, CHECK_FINGERPRINT) => {
                let Some(JValue::Str(fingerprint)) = args.first() else {
                    return Err(HostError::new(HostErrorCode::IllegalArgument, "checkHash needs a string"));
                };
                match &state.resident_fingerprint {
                    Some(resident) => Ok(JValue::Bool(resident == fingerprint)),
                    None => {
                        state.resident_fingerprint = Some(fingerprint.clone());
                        Ok(JValue::Bool(true))
                    }
                }
            }
            (MARKER_CLASS, IS_INSTRUMENTED) => Ok(JValue::Bool(state.instrumented)),
            (MARKER_CLASS, MARK_INSTRUMENTED) => {
                state.instrumented = true;
                Ok(JValue::Void)
            }
            (HANDLER_WRAPPER_CLASS, PREPARE_FOR_HOT_SWAP) => {
                if !state.hooked {
                    return Err(HostError::new(
                        HostErrorCode::Exception,
                        "activity handler is not instrumented",
                    ));
                }
                let Some(token) = args.first().and_then(JValue::as_long) else {
                    return Err(HostError::new(HostErrorCode::IllegalArgument, "prepareForHotSwap needs a long"));
                };
                state.pending_token = Some(token);
                Ok(JValue::Void)
            }
            _ => Err(HostError::new(
                HostErrorCode::MethodNotFound,
                format!("{class_name}.{method}"),
            )),
        }
    }

    fn register_natives(&self, bindings: &[NativeBinding]) -> Result<(), HostError> {
        let mut state = self.enter();
        if let Some(missing) = bindings.iter().find(|b| !state.classes.contains_key(b.class)) {
            return Err(class_not_found(missing.class));
        }
        for binding in bindings {
            state.natives.insert((binding.class, binding.method), binding.function);
        }
        Ok(())
    }

    fn process_id(&self) -> u32 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClassDefinition;

    struct Suffix;

    impl ClassLoadHook for Suffix {
        fn on_class_file_load(&self, _class_name: &str, class_data: &[u8]) -> Option<Vec<u8>> {
            let mut out = class_data.to_vec();
            out.push(b'!');
            Some(out)
        }
    }

    #[test]
    fn marker_records_first_fingerprint() {
        let host = SimulatedHost::new();
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("p.jar");
        std::fs::write(&jar, b"jar").unwrap();

        assert!(!host.find_class(MARKER_CLASS));
        host.append_to_bootstrap_search(&jar).unwrap();
        assert!(host.find_class(MARKER_CLASS));

        let check = |fp: &str| {
            host.call_static(MARKER_CLASS, &CHECK_FINGERPRINT, &[JValue::Str(fp.to_string())])
                .unwrap()
        };
        assert_eq!(check("aa"), JValue::Bool(true));
        assert_eq!(check("aa"), JValue::Bool(true));
        assert_eq!(check("bb"), JValue::Bool(false));
        assert_eq!(host.resident_fingerprint().as_deref(), Some("aa"));
    }

    #[test]
    fn hook_only_sees_retransform_while_notified() {
        let host = SimulatedHost::new();
        host.add_capabilities(&Capabilities::ALL).unwrap();
        host.set_load_hook(Some(Arc::new(Suffix))).unwrap();

        host.retransform_class(HOOK_TARGET_CLASS).unwrap();
        assert_eq!(host.class_bytes(HOOK_TARGET_CLASS).unwrap(), b"ActivityThread$H");

        host.set_load_notification(true).unwrap();
        host.retransform_class(HOOK_TARGET_CLASS).unwrap();
        assert_eq!(host.class_bytes(HOOK_TARGET_CLASS).unwrap(), b"ActivityThread$H!");
        assert_eq!(host.retransform_count(HOOK_TARGET_CLASS), 2);
    }

    #[test]
    fn redefinition_is_all_or_nothing() {
        let host = SimulatedHost::new()
            .with_class("com/example/A", b"a".to_vec())
            .with_class("com/example/B", b"b".to_vec())
            .with_incompatible_class("com/example/B");
        host.add_capabilities(&Capabilities::ALL).unwrap();

        let change_set = ChangeSet {
            classes: vec![
                ClassDefinition {
                    name: "com/example/A".to_string(),
                    bytecode: b"a2".to_vec(),
                },
                ClassDefinition {
                    name: "com/example/B".to_string(),
                    bytecode: b"b2".to_vec(),
                },
            ],
        };
        let err = host.redefine_classes(&change_set).unwrap_err();
        assert_eq!(err.code, HostErrorCode::UnsupportedChange);
        assert_eq!(host.class_bytes("com/example/A").unwrap(), b"a");
        assert_eq!(host.redefinitions(), 0);
    }

    #[test]
    fn each_simulated_process_has_its_own_pid() {
        let first = SimulatedHost::new();
        let second = SimulatedHost::new();
        assert!(first.process_id() >= FIRST_PID);
        assert_ne!(first.process_id(), second.process_id());
    }

    #[test]
    fn handler_keeps_only_the_latest_token() {
        let host = SimulatedHost::new();
        host.add_capabilities(&Capabilities::ALL).unwrap();
        host.set_load_hook(Some(Arc::new(Suffix))).unwrap();
        host.set_load_notification(true).unwrap();
        host.retransform_class(HOOK_TARGET_CLASS).unwrap();
        host.state.lock().classes.entry(HANDLER_WRAPPER_CLASS.to_string()).or_default();

        for token in [7, 8] {
            host.call_static(HANDLER_WRAPPER_CLASS, &PREPARE_FOR_HOT_SWAP, &[JValue::Long(token)])
                .unwrap();
        }
        assert_eq!(host.pending_token(), Some(8));
    }

    #[test]
    fn capabilities_beyond_potential_are_refused() {
        let host = SimulatedHost::new().with_capabilities(Capabilities::NONE);
        assert!(host.add_capabilities(&Capabilities::ALL).is_err());
        assert_eq!(host.granted(), Capabilities::NONE);
        assert_eq!(host.calls(), 1);
    }
}
