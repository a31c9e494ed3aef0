//! One-time instrumentation
//!
//! Installs the re-entry hook the deferred swap path relies on: a transform
//! of exactly one well-known class, applied by forcing a retransform of that
//! class while class load notification is briefly enabled.
//!
//! Load notification is process-wide and taxes every class load while on,
//! so it is scoped by [`NotificationWindow`]: opening the window enables it
//! and dropping the window disables it, whatever the retransform returned.
//! Only one window is ever opened per process because the coordinator is
//! gated by the marker's completion flag; that gate relies on the host
//! serializing attaches, not on a lock.

use crate::error::InstrumentationError;
use crate::host::{ClassLoadHook, HostError, HostRuntime};
use crate::marker::VerifiedMarker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Class whose message handler receives the re-entry hook
pub const HOOK_TARGET_CLASS: &str = "android/app/ActivityThread$H";

/// Rewrites the bytes of one class
///
/// Implementations own the bytecode rewriting; the agent only decides when
/// they run.
pub trait ClassTransform: Send + Sync {
    /// Return the rewritten class, or `None` to leave it unchanged
    fn transform(&self, class_name: &str, class_data: &[u8]) -> Option<Vec<u8>>;
}

/// Transforms keyed by class name, served to the host as its load hook
#[derive(Default)]
pub struct TransformRegistry {
    transforms: Mutex<HashMap<String, Arc<dyn ClassTransform>>>,
}

impl TransformRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transform` for `class_name`, replacing any earlier one
    pub fn add(&self, class_name: impl Into<String>, transform: Arc<dyn ClassTransform>) {
        self.transforms.lock().insert(class_name.into(), transform);
    }

    /// Drop every registered transform
    pub fn clear(&self) {
        self.transforms.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transforms.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transforms.lock().is_empty()
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.transforms.lock();
        f.debug_struct("TransformRegistry")
            .field("classes", &guard.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ClassLoadHook for TransformRegistry {
    fn on_class_file_load(&self, class_name: &str, class_data: &[u8]) -> Option<Vec<u8>> {
        let transform = self.transforms.lock().get(class_name).cloned()?;
        let rewritten = transform.transform(class_name, class_data);
        if rewritten.is_some() {
            tracing::debug!(class = class_name, "class transformed");
        }
        rewritten
    }
}

/// Load notification, enabled for as long as this value lives
pub struct NotificationWindow<'h> {
    host: &'h dyn HostRuntime,
}

impl<'h> NotificationWindow<'h> {
    /// Enable load notification
    ///
    /// # Errors
    /// Returns the host error; notification is then still disabled
    pub fn open(host: &'h dyn HostRuntime) -> Result<Self, HostError> {
        host.set_load_notification(true)?;
        Ok(Self { host })
    }
}

impl Drop for NotificationWindow<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.host.set_load_notification(false) {
            tracing::warn!(error = %e, "failed to disable load notification");
        }
    }
}

/// Load hook installed for as long as this value lives
struct HookRegistration<'h> {
    host: &'h dyn HostRuntime,
    registry: Arc<TransformRegistry>,
}

impl<'h> HookRegistration<'h> {
    fn install(
        host: &'h dyn HostRuntime,
        registry: Arc<TransformRegistry>,
    ) -> Result<Self, HostError> {
        host.set_load_hook(Some(registry.clone()))?;
        Ok(Self { host, registry })
    }
}

impl Drop for HookRegistration<'_> {
    fn drop(&mut self) {
        self.registry.clear();
        if let Err(e) = self.host.set_load_hook(None) {
            tracing::warn!(error = %e, "failed to clear load hook");
        }
    }
}

/// The one class to hook and how to rewrite it
#[derive(Clone)]
pub struct InstrumentationPlan {
    pub target_class: String,
    pub transform: Arc<dyn ClassTransform>,
}

impl InstrumentationPlan {
    /// Hook [`HOOK_TARGET_CLASS`] with `transform`
    #[must_use]
    pub fn new(transform: Arc<dyn ClassTransform>) -> Self {
        Self::for_class(HOOK_TARGET_CLASS, transform)
    }

    #[must_use]
    pub fn for_class(target_class: impl Into<String>, transform: Arc<dyn ClassTransform>) -> Self {
        Self {
            target_class: target_class.into(),
            transform,
        }
    }
}

impl fmt::Debug for InstrumentationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentationPlan")
            .field("target_class", &self.target_class)
            .finish_non_exhaustive()
    }
}

/// Installs the hook at most once per process
#[derive(Debug, Clone, Copy)]
pub struct InstrumentationCoordinator<'p> {
    plan: &'p InstrumentationPlan,
}

impl<'p> InstrumentationCoordinator<'p> {
    #[must_use]
    pub const fn new(plan: &'p InstrumentationPlan) -> Self {
        Self { plan }
    }

    /// Read the marker's completion flag
    ///
    /// # Errors
    /// [`InstrumentationError::Marker`] if the marker cannot be read
    pub fn is_instrumented(&self, marker: &VerifiedMarker<'_>) -> Result<bool, InstrumentationError> {
        marker.is_instrumented().map_err(InstrumentationError::Marker)
    }

    /// Install the hook and set the completion flag
    ///
    /// # Errors
    /// Returns [`InstrumentationError`] if the target is missing, the host
    /// refuses any step, or the flag cannot be set
    pub fn instrument(
        &self,
        host: &dyn HostRuntime,
        marker: &VerifiedMarker<'_>,
    ) -> Result<(), InstrumentationError> {
        let target = self.plan.target_class.as_str();
        let registry = Arc::new(TransformRegistry::new());
        registry.add(target, Arc::clone(&self.plan.transform));

        let hook = HookRegistration::install(host, registry)
            .map_err(InstrumentationError::LoadHook)?;

        if !host.find_class(target) {
            return Err(InstrumentationError::TargetNotFound(target.to_string()));
        }

        let retransformed = {
            let _window =
                NotificationWindow::open(host).map_err(InstrumentationError::Notification)?;
            host.retransform_class(target)
        };
        drop(hook);

        retransformed.map_err(|source| InstrumentationError::Retransform {
            class: target.to_string(),
            source,
        })?;

        marker
            .mark_instrumented()
            .map_err(InstrumentationError::Marker)?;
        tracing::info!(class = target, "finished instrumenting");
        Ok(())
    }
}
