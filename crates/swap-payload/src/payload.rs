//! The bootstrap payload
//!
//! A [`Payload`] is the helper archive the agent injects into the target
//! process, paired with the fingerprint it was built with.

use crate::fingerprint::Fingerprint;
use std::borrow::Cow;
use std::path::Path;

/// File name prefix shared by every payload build
pub const FILE_PREFIX: &str = "instruments-";

/// File name suffix shared by every payload build
pub const FILE_SUFFIX: &str = ".jar";

/// Helper archive bytes plus their fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    bytes: Cow<'static, [u8]>,
    fingerprint: Fingerprint,
}

impl Payload {
    /// Wrap payload bytes, fingerprinting them
    #[must_use]
    pub fn new(bytes: impl Into<Cow<'static, [u8]>>) -> Self {
        let bytes = bytes.into();
        let fingerprint = Fingerprint::compute(&bytes);
        Self { bytes, fingerprint }
    }

    /// Wrap payload bytes embedded at build time together with the
    /// fingerprint the build recorded for them
    ///
    /// The fingerprint is trusted as given; use [`Payload::verify`] to check it.
    #[must_use]
    pub const fn with_fingerprint(bytes: &'static [u8], fingerprint: Fingerprint) -> Self {
        Self {
            bytes: Cow::Borrowed(bytes),
            fingerprint,
        }
    }

    /// Read a payload from disk and fingerprint it
    ///
    /// # Errors
    /// Returns the underlying I/O error if the file cannot be read
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::new(bytes))
    }

    /// Payload bytes
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Fingerprint this payload was built with
    #[inline]
    #[must_use]
    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Payload size in bytes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Check that the recorded fingerprint matches the bytes
    #[must_use]
    pub fn verify(&self) -> bool {
        Fingerprint::compute(&self.bytes) == self.fingerprint
    }

    /// Content-addressed file name: `instruments-<fingerprint>.jar`
    #[must_use]
    pub fn file_name(&self) -> String {
        file_name_for(&self.fingerprint)
    }
}

/// Content-addressed file name for a fingerprint
#[must_use]
pub fn file_name_for(fingerprint: &Fingerprint) -> String {
    format!("{FILE_PREFIX}{fingerprint}{FILE_SUFFIX}")
}

/// Recover the fingerprint from a content-addressed file name
#[must_use]
pub fn fingerprint_from_file_name(name: &str) -> Option<Fingerprint> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}
