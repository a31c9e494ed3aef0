//! Process-lifetime marker and the version guard in front of it
//!
//! The marker is a class inside the bootstrap payload. Once the payload is
//! visible, the marker resolves by name from every later attach in the same
//! process and holds two facts: the fingerprint of the payload that claimed
//! the process (recorded by the first fingerprint check), and whether the
//! one-time hook has been installed. Nothing ever clears it; it lives as long
//! as the process.
//!
//! "Absent by name means not installed" is only sound because the host
//! serializes attaches. Two agents probing concurrently could both see it
//! absent.
//!
//! The only marker method that may be called before the fingerprint is
//! confirmed is the check itself. Everything else hangs off
//! [`VerifiedMarker`], which only [`VersionGuard::check`] hands out.

use crate::error::VersionMismatchError;
use crate::host::{HostError, HostErrorCode, HostRuntime, JValue, MethodSig};
use swap_payload::Fingerprint;

/// Stable name of the marker class
pub const MARKER_CLASS: &str = "com/android/tools/deploy/instrument/Breadcrumb";

/// Compares (and on first call records) the resident fingerprint
pub const CHECK_FINGERPRINT: MethodSig = MethodSig::new("checkHash", "(Ljava/lang/String;)Z");

/// Reads the one-time instrumentation flag
pub const IS_INSTRUMENTED: MethodSig = MethodSig::new("isFinishedInstrumenting", "()Z");

/// Sets the one-time instrumentation flag
pub const MARK_INSTRUMENTED: MethodSig = MethodSig::new("setFinishedInstrumenting", "()V");

/// Whether the marker is resolvable in this process
#[must_use]
pub fn is_resident(host: &dyn HostRuntime) -> bool {
    host.find_class(MARKER_CLASS)
}

/// Stops the session when a different payload build owns the process
#[derive(Debug, Clone, Copy)]
pub struct VersionGuard {
    build: Fingerprint,
}

impl VersionGuard {
    #[must_use]
    pub const fn new(build: Fingerprint) -> Self {
        Self { build }
    }

    /// Compare the resident fingerprint with this build
    ///
    /// # Errors
    /// [`VersionMismatchError::Mismatch`] if the marker reports a different
    /// build; [`VersionMismatchError::Unverifiable`] if it cannot be asked.
    pub fn check<'h>(
        &self,
        host: &'h dyn HostRuntime,
    ) -> Result<VerifiedMarker<'h>, VersionMismatchError> {
        let reply = host
            .call_static(
                MARKER_CLASS,
                &CHECK_FINGERPRINT,
                &[JValue::Str(self.build.to_hex())],
            )
            .map_err(|source| VersionMismatchError::Unverifiable {
                build: self.build,
                source,
            })?;

        match reply.as_bool() {
            Some(true) => {
                tracing::debug!(fingerprint = %self.build.short(), "resident payload matches build");
                Ok(VerifiedMarker { host })
            }
            Some(false) => Err(VersionMismatchError::Mismatch { build: self.build }),
            None => Err(VersionMismatchError::Unverifiable {
                build: self.build,
                source: unexpected_reply(&CHECK_FINGERPRINT, &reply),
            }),
        }
    }
}

/// Marker whose payload build matches this agent
pub struct VerifiedMarker<'h> {
    host: &'h dyn HostRuntime,
}

impl VerifiedMarker<'_> {
    /// Whether the one-time hook is already installed
    ///
    /// # Errors
    /// Returns the host error, or an `Internal` error on a non-boolean reply
    pub fn is_instrumented(&self) -> Result<bool, HostError> {
        let reply = self.host.call_static(MARKER_CLASS, &IS_INSTRUMENTED, &[])?;
        reply
            .as_bool()
            .ok_or_else(|| unexpected_reply(&IS_INSTRUMENTED, &reply))
    }

    /// Record that the one-time hook is installed
    ///
    /// # Errors
    /// Returns the host error
    pub fn mark_instrumented(&self) -> Result<(), HostError> {
        self.host.call_static(MARKER_CLASS, &MARK_INSTRUMENTED, &[])?;
        Ok(())
    }
}

fn unexpected_reply(method: &MethodSig, reply: &JValue) -> HostError {
    HostError::new(
        HostErrorCode::Internal,
        format!("{MARKER_CLASS}.{method} returned {reply:?}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockHostRuntime;
    use mockall::predicate::eq;

    #[test]
    fn matching_fingerprint_yields_verified_marker() {
        let build = Fingerprint::compute(b"v1");
        let mut host = MockHostRuntime::new();
        host.expect_call_static()
            .withf(move |class, method, args| {
                class == MARKER_CLASS
                    && *method == CHECK_FINGERPRINT
                    && args == [JValue::Str(build.to_hex())]
            })
            .times(1)
            .returning(|_, _, _| Ok(JValue::Bool(true)));
        host.expect_call_static()
            .withf(|_, method, _| *method == IS_INSTRUMENTED)
            .times(1)
            .returning(|_, _, _| Ok(JValue::Bool(false)));

        let marker = VersionGuard::new(build).check(&host).unwrap();
        assert!(!marker.is_instrumented().unwrap());
    }

    #[test]
    fn different_fingerprint_is_mismatch() {
        let mut host = MockHostRuntime::new();
        host.expect_call_static()
            .times(1)
            .returning(|_, _, _| Ok(JValue::Bool(false)));

        let err = VersionGuard::new(Fingerprint::compute(b"v2"))
            .check(&host)
            .err()
            .unwrap();
        assert!(matches!(err, VersionMismatchError::Mismatch { .. }));
    }

    #[test]
    fn failing_check_is_unverifiable() {
        let mut host = MockHostRuntime::new();
        host.expect_call_static().times(1).returning(|_, _, _| {
            Err(HostError::new(HostErrorCode::MethodNotFound, "no checkHash"))
        });

        let err = VersionGuard::new(Fingerprint::compute(b"v2"))
            .check(&host)
            .err()
            .unwrap();
        assert!(matches!(err, VersionMismatchError::Unverifiable { .. }));
    }

    #[test]
    fn residency_check_uses_marker_name() {
        let mut host = MockHostRuntime::new();
        host.expect_find_class()
            .with(eq(MARKER_CLASS))
            .times(1)
            .return_const(true);
        assert!(is_resident(&host));
    }
}
