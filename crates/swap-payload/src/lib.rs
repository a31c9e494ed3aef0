//! Swap Payload
//!
//! The helper archive the agent injects into a live process, identified by a
//! build-time content fingerprint and stored on disk under a content-addressed
//! name.
//!
//! # Core Concepts
//!
//! - [`Fingerprint`]: 32-byte Blake3 digest identifying one payload build
//! - [`Payload`]: payload bytes plus their fingerprint
//! - [`PayloadStore`]: write-once, content-addressed storage with atomic publish
//!
//! # Example
//!
//! ```rust,ignore
//! use swap_payload::{Payload, PayloadStore};
//!
//! let payload = Payload::new(include_bytes!("instruments.jar").as_slice());
//! let store = PayloadStore::new("/data/data/com.example/.studio");
//! let path = store.ensure_written(&payload)?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod fingerprint;
mod payload;
mod store;

pub use fingerprint::{Fingerprint, FingerprintError};
pub use payload::{fingerprint_from_file_name, file_name_for, Payload, FILE_PREFIX, FILE_SUFFIX};
pub use store::{PayloadStore, StoreError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
