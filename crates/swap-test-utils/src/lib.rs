//! Testing utilities for the swap agent workspace
//!
//! Shared fixtures: payload builds, requests, a counting handler transform and
//! a ready-to-attach agent wired to in-memory connections.

#![allow(missing_docs)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use swap_agent::config::{AgentConfig, PayloadDir};
use swap_agent::instrument::{ClassTransform, InstrumentationPlan};
use swap_agent::protocol::{ChangeSet, ClassDefinition, Request};
use swap_agent::session::Agent;
use swap_agent::test_harness::{MemoryConnector, SimulatedHost};
use swap_payload::Payload;

pub const TEST_PACKAGE: &str = "com.example.app";
pub const TEST_CLASS: &str = "com/example/app/MainActivity";
pub const TEST_CLASS_BYTES: &[u8] = b"MainActivity v0";
pub const TRANSFORM_SUFFIX: &[u8] = b"#hooked";

/// Handler transform that counts its invocations
#[derive(Debug, Default)]
pub struct RecordingTransform {
    calls: AtomicUsize,
}

impl RecordingTransform {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ClassTransform for RecordingTransform {
    fn transform(&self, _class_name: &str, class_data: &[u8]) -> Option<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = class_data.to_vec();
        out.extend_from_slice(TRANSFORM_SUFFIX);
        Some(out)
    }
}

pub fn create_test_payload_with(bytes: &[u8]) -> Payload {
    Payload::new(bytes.to_vec())
}

/// Payload build "v1"
pub fn create_test_payload() -> Payload {
    create_test_payload_with(b"instrumentation payload v1")
}

pub fn create_request(restart_activity: bool, classes: &[(&str, &[u8])]) -> Request {
    Request {
        package_name: TEST_PACKAGE.to_string(),
        restart_activity,
        change_set: ChangeSet {
            classes: classes
                .iter()
                .map(|(name, bytes)| ClassDefinition {
                    name: (*name).to_string(),
                    bytecode: bytes.to_vec(),
                })
                .collect(),
        },
    }
}

/// Redefine [`TEST_CLASS`] now
pub fn immediate_request() -> Request {
    create_request(false, &[(TEST_CLASS, b"MainActivity v1")])
}

/// Redefine [`TEST_CLASS`] at the next activity restart
pub fn restart_request() -> Request {
    create_request(true, &[(TEST_CLASS, b"MainActivity v1")])
}

/// Simulated process with [`TEST_CLASS`] loaded
pub fn create_test_host() -> SimulatedHost {
    SimulatedHost::new().with_class(TEST_CLASS, TEST_CLASS_BYTES.to_vec())
}

pub fn create_test_config(payload_dir: &Path) -> AgentConfig {
    AgentConfig::new().with_payload_dir(PayloadDir::Fixed(payload_dir.to_path_buf()))
}

/// An agent image attached over in-memory connections
pub struct TestAgent {
    pub agent: Agent<MemoryConnector>,
    pub connector: MemoryConnector,
    pub transform: Arc<RecordingTransform>,
}

pub fn setup_test_agent(payload_dir: &Path, payload: Payload) -> TestAgent {
    let connector = MemoryConnector::new();
    let transform = Arc::new(RecordingTransform::default());
    let agent = Agent::new(
        create_test_config(payload_dir),
        payload,
        connector.clone(),
        InstrumentationPlan::new(transform.clone()),
    );
    TestAgent {
        agent,
        connector,
        transform,
    }
}
