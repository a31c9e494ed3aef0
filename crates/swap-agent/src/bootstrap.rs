//! Bootstrap payload installation
//!
//! Puts the payload on disk (content-addressed, write-once) and, unless an
//! earlier attach already did, makes it visible to the bootstrap loader.
//! Visibility is process-wide and cannot be undone, so injection happens at
//! most once per process.

use crate::error::InstallError;
use crate::host::HostRuntime;
use crate::marker::{self, MARKER_CLASS};
use std::path::{Path, PathBuf};
use swap_payload::{Payload, PayloadStore};

/// Result of a successful install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    /// On-disk location of this build's payload
    pub path: PathBuf,
    /// Whether this attach injected the payload (false: already resident)
    pub injected: bool,
}

/// Installs one payload build
#[derive(Debug, Clone, Copy)]
pub struct BootstrapInstaller<'a> {
    payload: &'a Payload,
}

impl<'a> BootstrapInstaller<'a> {
    #[must_use]
    pub const fn new(payload: &'a Payload) -> Self {
        Self { payload }
    }

    /// Write the payload under `dir` if absent, then inject it unless the
    /// marker already resolves
    ///
    /// A resident marker may belong to a different build; that is for the
    /// version guard to decide, not this step.
    ///
    /// # Errors
    /// Returns [`InstallError`] if the payload cannot be written or injected
    pub fn install(&self, host: &dyn HostRuntime, dir: &Path) -> Result<Installed, InstallError> {
        let path = PayloadStore::new(dir).ensure_written(self.payload)?;

        if marker::is_resident(host) {
            tracing::debug!("payload already resident, skipping injection");
            return Ok(Installed {
                path,
                injected: false,
            });
        }

        tracing::info!(path = %path.display(), "no resident payload, injecting");
        host.append_to_bootstrap_search(&path)
            .map_err(|source| InstallError::Inject {
                path: path.clone(),
                source,
            })?;

        if !marker::is_resident(host) {
            return Err(InstallError::MarkerUnresolvable {
                class: MARKER_CLASS,
                path,
            });
        }

        Ok(Installed {
            path,
            injected: true,
        })
    }
}
