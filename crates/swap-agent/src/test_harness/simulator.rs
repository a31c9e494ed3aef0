//! Attach simulator
//!
//! Drives repeated attach sessions against one [`SimulatedHost`], playing
//! the controller over in-memory connections, and checks the per-process
//! guarantees along the way:
//! - every session answers, and answers with the host's pid
//! - the deferred path answers twice, interim first, on one connection
//! - the hook target is retransformed exactly once however many attaches run
//! - load notification and the load hook are off between attaches
//! - the payload is injected once

use super::channel::{ControllerEnd, MemoryConnector, Received};
use super::runtime::SimulatedHost;
use crate::config::{AgentConfig, PayloadDir};
use crate::host::HostRuntime;
use crate::instrument::{ClassTransform, InstrumentationPlan, HOOK_TARGET_CLASS};
use crate::protocol::{ChangeSet, ClassDefinition, Request, Status};
use crate::session::Agent;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use swap_payload::Payload;

/// Package the simulated application runs as
pub const SIMULATED_PACKAGE: &str = "com.example.simulated";

/// Application class the simulated change sets redefine
pub const SIMULATED_CLASS: &str = "com/example/simulated/MainActivity";

/// Bytes the simulated handler hook appends
pub const HOOK_SUFFIX: &[u8] = b"#hooked";

/// Payload injected when the configuration names none
pub const SIMULATED_PAYLOAD: &[u8] = b"simulated instrumentation payload";

/// Transform standing in for the handler rewrite
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerHook;

impl ClassTransform for HandlerHook {
    fn transform(&self, _class_name: &str, class_data: &[u8]) -> Option<Vec<u8>> {
        let mut out = class_data.to_vec();
        out.extend_from_slice(HOOK_SUFFIX);
        Some(out)
    }
}

/// Which path each simulated request takes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SwapMode {
    /// Swap applied at once
    #[default]
    Immediate,
    /// Swap deferred to a simulated activity restart
    Restart,
    /// Swap rejected by the host as a shape change
    Reject,
}

impl SwapMode {
    /// Every mode, in certification order
    pub const ALL: [Self; 3] = [Self::Immediate, Self::Restart, Self::Reject];

    /// Name used on the command line
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Restart => "restart",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for SwapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown swap mode: {s}"))
    }
}

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Attaches to run against one process
    pub attaches: u64,
    /// Path every request takes
    pub mode: SwapMode,
    /// Payload the agent carries; [`SIMULATED_PAYLOAD`] when `None`
    pub payload: Option<Payload>,
    /// Payload directory; a fresh temporary one when `None`
    pub payload_dir: Option<PathBuf>,
    /// How long the controller waits for each response
    pub response_timeout: Duration,
    /// Stop at the first violation
    pub stop_on_first_violation: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            attaches: 10,
            mode: SwapMode::Immediate,
            payload: None,
            payload_dir: None,
            response_timeout: Duration::from_secs(2),
            stop_on_first_violation: false,
        }
    }
}

/// A broken guarantee
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Session ended in `Failed`
    SessionFailed { attach: u64, error: String },
    /// Controller got something other than the expected status
    UnexpectedResponse {
        attach: u64,
        expected: Status,
        received: String,
    },
    /// Response carried the wrong pid
    WrongPid { attach: u64, pid: u32 },
    /// Restart signal did not complete the parked swap
    RestartNotCompleted { attach: u64 },
    /// Connection stayed open after the final response
    ConnectionLeftOpen { attach: u64 },
    /// Hook target retransformed other than exactly once
    RetransformCount { count: usize },
    /// Payload injected other than exactly once
    InjectionCount { count: usize },
    /// Load notification still enabled after a session
    NotificationLeftOn { attach: u64 },
    /// Load hook still installed after a session
    LoadHookLeftInstalled { attach: u64 },
}

/// Counters for one run
#[derive(Debug, Clone, Default)]
pub struct SimulatorStats {
    pub attaches: u64,
    pub sessions_failed: u64,
    pub responses_ok: u64,
    pub responses_error: u64,
    pub responses_interim: u64,
    pub redefinitions: usize,
    pub hook_retransforms: usize,
}

/// Final report from the simulator
#[derive(Debug, Clone)]
pub struct SimulatorReport {
    /// Configuration the run used
    pub config: SimulatorConfig,
    /// Counters
    pub stats: SimulatorStats,
    /// Every broken guarantee, in order found
    pub violations: Vec<Violation>,
}

impl SimulatorReport {
    /// No guarantee was broken
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable summary
    #[must_use]
    pub fn generate_text(&self) -> String {
        use std::fmt::Write as _;

        let mut report = String::new();
        let _ = writeln!(report, "=== Swap Agent Simulator Report ===\n");
        let _ = writeln!(report, "Mode: {}", self.config.mode);
        let _ = writeln!(report, "Attaches: {}", self.stats.attaches);
        let _ = writeln!(report, "Sessions Failed: {}", self.stats.sessions_failed);
        let _ = writeln!(report, "Responses OK: {}", self.stats.responses_ok);
        let _ = writeln!(report, "Responses ERROR: {}", self.stats.responses_error);
        let _ = writeln!(report, "Responses NEED_ACTIVITY_RESTART: {}", self.stats.responses_interim);
        let _ = writeln!(report, "Redefinitions: {}", self.stats.redefinitions);
        let _ = writeln!(report, "Hook Retransforms: {} (SHOULD BE 1)", self.stats.hook_retransforms);
        let _ = writeln!(report, "Violations: {}", self.violations.len());

        if !self.violations.is_empty() {
            let _ = writeln!(report, "\n=== Violations ===");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(report, "{}. {v:?}", i + 1);
            }
        }

        let _ = writeln!(
            report,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        report
    }
}

/// Request for attach number `attach`
#[must_use]
pub fn simulated_request(attach: u64, mode: SwapMode) -> Request {
    Request {
        package_name: SIMULATED_PACKAGE.to_string(),
        restart_activity: mode == SwapMode::Restart,
        change_set: ChangeSet {
            classes: vec![ClassDefinition {
                name: SIMULATED_CLASS.to_string(),
                bytecode: format!("MainActivity v{attach}").into_bytes(),
            }],
        },
    }
}

/// Host for a simulated application
#[must_use]
pub fn simulated_host(mode: SwapMode) -> SimulatedHost {
    let host = SimulatedHost::new().with_class(SIMULATED_CLASS, b"MainActivity v0".to_vec());
    if mode == SwapMode::Reject {
        host.with_incompatible_class(SIMULATED_CLASS)
    } else {
        host
    }
}

/// Run the simulator
///
/// # Errors
/// Returns an I/O error if no temporary payload directory can be created
pub fn run_simulator(config: SimulatorConfig) -> std::io::Result<SimulatorReport> {
    let scratch;
    let payload_dir = match &config.payload_dir {
        Some(dir) => dir.clone(),
        None => {
            scratch = tempfile::tempdir()?;
            scratch.path().to_path_buf()
        }
    };

    let connector = MemoryConnector::new();
    let agent = Agent::new(
        AgentConfig::new().with_payload_dir(PayloadDir::Fixed(payload_dir)),
        config
            .payload
            .clone()
            .unwrap_or_else(|| Payload::new(SIMULATED_PAYLOAD.to_vec())),
        connector.clone(),
        InstrumentationPlan::new(Arc::new(HandlerHook)),
    );
    let host = simulated_host(config.mode);

    let mut stats = SimulatorStats::default();
    let mut violations = Vec::new();

    for attach in 0..config.attaches {
        stats.attaches += 1;
        let controller = connector.dial();
        controller.send_request(&simulated_request(attach, config.mode));

        let report = agent.on_attach(&host);
        if let Some(err) = &report.error {
            stats.sessions_failed += 1;
            violations.push(Violation::SessionFailed {
                attach,
                error: err.to_string(),
            });
        } else {
            check_responses(&config, &host, &controller, attach, &mut stats, &mut violations);
        }

        if host.notification_enabled() {
            violations.push(Violation::NotificationLeftOn { attach });
        }
        if host.has_load_hook() {
            violations.push(Violation::LoadHookLeftInstalled { attach });
        }
        if config.stop_on_first_violation && !violations.is_empty() {
            break;
        }
    }

    stats.redefinitions = host.redefinitions();
    stats.hook_retransforms = host.retransform_count(HOOK_TARGET_CLASS);
    if stats.attaches > 0 {
        if stats.hook_retransforms != 1 {
            violations.push(Violation::RetransformCount {
                count: stats.hook_retransforms,
            });
        }
        let injections = host.bootstrap_archives().len();
        if injections != 1 {
            violations.push(Violation::InjectionCount { count: injections });
        }
    }

    tracing::info!(
        mode = %config.mode,
        attaches = stats.attaches,
        violations = violations.len(),
        "simulation finished"
    );
    Ok(SimulatorReport {
        config,
        stats,
        violations,
    })
}

fn check_responses(
    config: &SimulatorConfig,
    host: &SimulatedHost,
    controller: &ControllerEnd,
    attach: u64,
    stats: &mut SimulatorStats,
    violations: &mut Vec<Violation>,
) {
    let expect = |expected: Status, stats: &mut SimulatorStats, violations: &mut Vec<Violation>| {
        match controller.recv(config.response_timeout) {
            Received::Response(r) if r.status == expected => {
                match r.status {
                    Status::Ok => stats.responses_ok += 1,
                    Status::Error => stats.responses_error += 1,
                    Status::NeedActivityRestart => stats.responses_interim += 1,
                }
                if r.pid != host.process_id() {
                    violations.push(Violation::WrongPid { attach, pid: r.pid });
                }
                true
            }
            other => {
                violations.push(Violation::UnexpectedResponse {
                    attach,
                    expected,
                    received: format!("{other:?}"),
                });
                false
            }
        }
    };

    let finished = match config.mode {
        SwapMode::Immediate => expect(Status::Ok, stats, violations),
        SwapMode::Reject => expect(Status::Error, stats, violations),
        SwapMode::Restart => {
            if !expect(Status::NeedActivityRestart, stats, violations) {
                return;
            }
            if host.signal_restart() != Some(true) {
                violations.push(Violation::RestartNotCompleted { attach });
            }
            expect(Status::Ok, stats, violations)
        }
    };

    if finished && controller.recv(config.response_timeout) != Received::Closed {
        violations.push(Violation::ConnectionLeftOpen { attach });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_mode_passes() {
        for mode in SwapMode::ALL {
            let report = run_simulator(SimulatorConfig {
                attaches: 4,
                mode,
                ..SimulatorConfig::default()
            })
            .unwrap();
            assert!(report.passed(), "{mode}: {}", report.generate_text());
            assert_eq!(report.stats.hook_retransforms, 1);
        }
    }

    #[test]
    fn configured_payload_is_the_one_installed() {
        let dir = tempfile::tempdir().unwrap();
        let payload = Payload::new(b"payload from a build".to_vec());
        let report = run_simulator(SimulatorConfig {
            attaches: 2,
            payload: Some(payload.clone()),
            payload_dir: Some(dir.path().to_path_buf()),
            ..SimulatorConfig::default()
        })
        .unwrap();

        assert!(report.passed(), "{}", report.generate_text());
        let artifact = dir.path().join(payload.file_name());
        assert_eq!(std::fs::read(artifact).unwrap(), payload.bytes());
    }

    #[test]
    fn mode_parses_from_name() {
        assert_eq!("restart".parse::<SwapMode>().unwrap(), SwapMode::Restart);
        assert!("sometimes".parse::<SwapMode>().is_err());
    }
}
