//! Swap agent
//!
//! Runs inside a live application process each time a controller attaches
//! it, and applies one code change per attach:
//! 1. **Bootstrap**: write the instrumentation payload (content-addressed)
//!    and make it visible to the bootstrap loader, once per process
//! 2. **Version guard**: refuse to work against a payload from another build
//! 3. **Instrument once**: hook the activity message handler, once per process
//! 4. **Swap**: redefine classes now, or hand the request to the hooked
//!    handler to apply at the next activity restart
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use swap_agent::prelude::*;
//!
//! let config = AgentConfig::new().from_env()?;
//! swap_agent::logging::init(&config.log);
//!
//! let agent = Agent::with_unix_socket(
//!     config,
//!     Payload::with_fingerprint(PAYLOAD_BYTES, PAYLOAD_FINGERPRINT),
//!     InstrumentationPlan::new(handler_transform),
//! );
//!
//! // From the host's attach entry point:
//! let report = agent.on_attach(&host);
//! ```

// Core modules
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod protocol;
pub mod state_machine;
pub mod transport;

// Attach flow
pub mod bootstrap;
pub mod capabilities;
pub mod handoff;
pub mod instrument;
pub mod marker;
pub mod session;
pub mod swap;

// Test harness
pub mod test_harness;

pub use error::*;

/// Common imports for embedding the agent
pub mod prelude {
    pub use crate::config::{AgentConfig, PayloadDir};
    pub use crate::error::{AttachError, ErrorKind};
    pub use crate::host::{
        Capabilities, ClassLoadHook, HostError, HostErrorCode, HostRuntime, JValue, MethodSig,
        NativeBinding,
    };
    pub use crate::instrument::{ClassTransform, InstrumentationPlan, HOOK_TARGET_CLASS};
    pub use crate::protocol::{ChangeSet, ClassDefinition, Request, Response, Status};
    pub use crate::session::{Agent, Completion, SessionReport};
    pub use crate::state_machine::SessionState;
    pub use crate::transport::{Connection, Connector};
    pub use swap_payload::{Fingerprint, Payload};

    #[cfg(unix)]
    pub use crate::transport::UnixConnector;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
