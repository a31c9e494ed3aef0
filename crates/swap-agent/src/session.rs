//! Attach session orchestration
//!
//! [`Agent::on_attach`] is what the host's attach entry point calls. It runs
//! one session from connect to a terminal state:
//!
//! ```text
//! Connecting → AwaitingRequest → CapabilityAcquisition → BootstrapCheck
//!   → VersionCheck → AlreadyInstrumented | InstrumentOnce → Dispatch
//!   → ImmediateSwap → Respond → Done
//!   | DeferredHandoff → RespondPending → DoneDeferred
//! ```
//!
//! Any failure moves straight to `Failed` with nothing undone and no
//! response written; the controller sees the connection close. Sessions are
//! assumed to be serialized by the host's attach mechanism; the bootstrap
//! residency check and the one-time instrumentation gate depend on it.

use crate::bootstrap::BootstrapInstaller;
use crate::capabilities;
use crate::config::AgentConfig;
use crate::error::{AttachError, InstallError};
use crate::handoff::RestartHandoff;
use crate::host::HostRuntime;
use crate::instrument::{InstrumentationCoordinator, InstrumentationPlan};
use crate::marker::VersionGuard;
use crate::protocol::{Request, Response};
use crate::state_machine::{validate_transition, SessionState};
use crate::swap::SwapExecutor;
use crate::transport::Connector;
use std::sync::atomic::{AtomicUsize, Ordering};
use swap_payload::Payload;

#[cfg(unix)]
use crate::transport::UnixConnector;

/// Attaches seen by this agent image in this process
static ATTACH_COUNT: AtomicUsize = AtomicUsize::new(0);

/// How a successful session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Swap applied (or rejected) and answered
    Immediate(Response),
    /// Interim answered; the swap is parked under `token`
    Deferred {
        /// Claims the parked swap
        token: i64,
    },
}

/// Outcome of one attach
///
/// The host always gets a plain success from the entry point; this report is
/// for logging and tests.
#[derive(Debug)]
pub struct SessionReport {
    /// Terminal state
    pub state: SessionState,
    /// Every state entered, in order
    pub history: Vec<SessionState>,
    /// Set when the session succeeded
    pub completion: Option<Completion>,
    /// Set when the session failed
    pub error: Option<AttachError>,
}

impl SessionReport {
    /// Session reached `Done` or `DoneDeferred`
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Session parked a deferred swap
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        matches!(self.completion, Some(Completion::Deferred { .. }))
    }

    /// Response written by an immediate session
    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        match &self.completion {
            Some(Completion::Immediate(r)) => Some(r),
            _ => None,
        }
    }

    /// Whether the session passed through `state`
    #[must_use]
    pub fn visited(&self, state: SessionState) -> bool {
        self.history.contains(&state)
    }
}

/// Agent image: configuration, embedded payload, connector and hook plan
pub struct Agent<C> {
    config: AgentConfig,
    payload: Payload,
    connector: C,
    plan: InstrumentationPlan,
}

#[cfg(unix)]
impl Agent<UnixConnector> {
    /// Agent connecting to the socket named in `config`
    #[must_use]
    pub fn with_unix_socket(config: AgentConfig, payload: Payload, plan: InstrumentationPlan) -> Self {
        let connector = UnixConnector::new(&config.socket_path, config.connect_timeout());
        Self::new(config, payload, connector, plan)
    }
}

impl<C: Connector> Agent<C> {
    /// Agent attaching through `connector`
    #[must_use]
    pub fn new(config: AgentConfig, payload: Payload, connector: C, plan: InstrumentationPlan) -> Self {
        Self {
            config,
            payload,
            connector,
            plan,
        }
    }

    /// Run one attach session against `host`
    ///
    /// Call from the host's attach thread. The connect step blocks on its
    /// own runtime, so calling from inside an async runtime fails the session
    /// with [`TransportError::NestedRuntime`](crate::transport::TransportError::NestedRuntime).
    ///
    /// Installing a `tracing` subscriber is left to the embedder (see
    /// [`crate::logging::init`]); without one the session logs nothing.
    pub fn on_attach(&self, host: &dyn HostRuntime) -> SessionReport {
        let prior = ATTACH_COUNT.fetch_add(1, Ordering::Relaxed);
        tracing::info!(prior, "prior agent invocations in this process");

        let mut session = AttachSession::new();
        match session.run(self, host) {
            Ok(completion) => SessionReport {
                state: session.state,
                history: session.history,
                completion: Some(completion),
                error: None,
            },
            Err(err) => {
                let failed_in = session.state;
                session.fail();
                if err.is_restart_required() {
                    tracing::error!(
                        kind = %err.kind(),
                        state = %failed_in,
                        error = %err,
                        "attach failed; restart the application to load this agent build"
                    );
                } else {
                    tracing::error!(kind = %err.kind(), state = %failed_in, error = %err, "attach failed");
                }
                SessionReport {
                    state: session.state,
                    history: session.history,
                    completion: None,
                    error: Some(err),
                }
            }
        }
    }
}

struct AttachSession {
    state: SessionState,
    history: Vec<SessionState>,
}

impl AttachSession {
    fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            history: vec![SessionState::Connecting],
        }
    }

    fn advance(&mut self, to: SessionState) -> Result<(), AttachError> {
        validate_transition(self.state, to)?;
        tracing::debug!(from = %self.state, to = %to, "session transition");
        self.state = to;
        self.history.push(to);
        Ok(())
    }

    fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
            self.history.push(SessionState::Failed);
        }
    }

    fn run<C: Connector>(
        &mut self,
        agent: &Agent<C>,
        host: &dyn HostRuntime,
    ) -> Result<Completion, AttachError> {
        let mut connection = agent.connector.connect()?;

        self.advance(SessionState::AwaitingRequest)?;
        let frame = connection.read_frame()?;
        let request = Request::decode(&frame)?;
        tracing::info!(
            package = %request.package_name,
            restart = request.restart_activity,
            classes = request.change_set.len(),
            "swap request received"
        );

        self.advance(SessionState::CapabilityAcquisition)?;
        capabilities::negotiate(host)?;

        self.advance(SessionState::BootstrapCheck)?;
        let dir = agent
            .config
            .payload_dir
            .resolve(&request.package_name)
            .ok_or_else(|| InstallError::PayloadDir(request.package_name.clone()))?;
        BootstrapInstaller::new(&agent.payload).install(host, &dir)?;

        self.advance(SessionState::VersionCheck)?;
        let marker = VersionGuard::new(*agent.payload.fingerprint()).check(host)?;

        let coordinator = InstrumentationCoordinator::new(&agent.plan);
        if coordinator.is_instrumented(&marker)? {
            self.advance(SessionState::AlreadyInstrumented)?;
        } else {
            self.advance(SessionState::InstrumentOnce)?;
            coordinator.instrument(host, &marker)?;
        }

        // An earlier agent image may have left its own natives bound.
        let handoff = RestartHandoff::new();
        handoff.register_natives(host)?;

        self.advance(SessionState::Dispatch)?;
        if request.restart_activity {
            self.advance(SessionState::DeferredHandoff)?;

            self.advance(SessionState::RespondPending)?;
            let token = handoff.respond_and_transfer(host, request, connection)?;

            self.advance(SessionState::DoneDeferred)?;
            Ok(Completion::Deferred { token })
        } else {
            self.advance(SessionState::ImmediateSwap)?;
            let response = SwapExecutor::new().execute(host, &request);

            self.advance(SessionState::Respond)?;
            connection.write_frame(&response.encode())?;

            self.advance(SessionState::Done)?;
            Ok(Completion::Immediate(response))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PayloadDir;
    use crate::error::ErrorKind;
    use crate::host::MockHostRuntime;
    use crate::instrument::ClassTransform;
    use crate::transport::{Connection, TransportError};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Identity;

    impl ClassTransform for Identity {
        fn transform(&self, _class_name: &str, _class_data: &[u8]) -> Option<Vec<u8>> {
            None
        }
    }

    /// Serves one scripted inbound frame; counts writes
    struct Scripted {
        inbound: Option<Vec<u8>>,
        writes: Arc<Mutex<usize>>,
    }

    impl Connection for Scripted {
        fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
            self.inbound.take().ok_or(TransportError::Closed)
        }

        fn write_frame(&mut self, _frame: &[u8]) -> Result<(), TransportError> {
            *self.writes.lock() += 1;
            Ok(())
        }
    }

    struct OneShot {
        inbound: Mutex<Option<Vec<u8>>>,
        writes: Arc<Mutex<usize>>,
    }

    impl Connector for OneShot {
        fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
            Ok(Box::new(Scripted {
                inbound: self.inbound.lock().take(),
                writes: Arc::clone(&self.writes),
            }))
        }
    }

    struct Unreachable;

    impl Connector for Unreachable {
        fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
            Err(TransportError::Closed)
        }
    }

    fn agent<C: Connector>(connector: C) -> Agent<C> {
        let dir = std::env::temp_dir().join("swap-agent-session-unit");
        Agent::new(
            AgentConfig::new().with_payload_dir(PayloadDir::Fixed(dir)),
            Payload::new(b"unit payload".to_vec()),
            connector,
            InstrumentationPlan::new(Arc::new(Identity)),
        )
    }

    #[test]
    fn malformed_request_makes_no_host_calls() {
        let writes = Arc::new(Mutex::new(0));
        let agent = agent(OneShot {
            inbound: Mutex::new(Some(b"{not json".to_vec())),
            writes: Arc::clone(&writes),
        });
        // Any call on a mock without expectations panics.
        let host = MockHostRuntime::new();

        let report = agent.on_attach(&host);
        assert_eq!(report.state, SessionState::Failed);
        assert_eq!(report.error.as_ref().map(AttachError::kind), Some(ErrorKind::Decode));
        assert_eq!(*writes.lock(), 0);
        assert!(!report.visited(SessionState::CapabilityAcquisition));
    }

    #[test]
    fn connect_failure_makes_no_host_calls() {
        let host = MockHostRuntime::new();
        let report = agent(Unreachable).on_attach(&host);
        assert_eq!(report.history, vec![SessionState::Connecting, SessionState::Failed]);
        assert_eq!(report.error.as_ref().map(AttachError::kind), Some(ErrorKind::Transport));
    }

    #[test]
    fn missing_capability_stops_before_bootstrap() {
        let writes = Arc::new(Mutex::new(0));
        let agent = agent(OneShot {
            inbound: Mutex::new(Some(br#"{"package_name":"com.example"}"#.to_vec())),
            writes: Arc::clone(&writes),
        });
        let mut host = MockHostRuntime::new();
        host.expect_potential_capabilities()
            .return_const(crate::host::Capabilities::NONE);

        let report = agent.on_attach(&host);
        assert_eq!(report.error.as_ref().map(AttachError::kind), Some(ErrorKind::Capability));
        assert!(!report.visited(SessionState::BootstrapCheck));
        assert_eq!(*writes.lock(), 0);
    }
}
