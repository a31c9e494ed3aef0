// Test harness module
// Simulated host, in-memory controller connections and the attach simulator

pub mod channel;
pub mod runtime;
pub mod simulator;

pub use channel::{memory_pair, ControllerEnd, MemoryConnection, MemoryConnector, Received};
pub use runtime::SimulatedHost;
pub use simulator::*;

/// Runs the simulator across every swap mode
pub struct TestHarness;

impl TestHarness {
    /// Run `attaches` attaches per mode, each mode against a fresh process
    ///
    /// # Errors
    /// Returns an I/O error if a temporary payload directory cannot be created
    pub fn run_certification(attaches: u64) -> std::io::Result<CertificationReport> {
        let mut reports = Vec::with_capacity(SwapMode::ALL.len());
        for mode in SwapMode::ALL {
            let config = SimulatorConfig {
                attaches,
                mode,
                ..SimulatorConfig::default()
            };
            reports.push(run_simulator(config)?);
        }

        let total_violations = reports.iter().map(|r| r.violations.len()).sum();
        Ok(CertificationReport {
            passed: total_violations == 0,
            total_violations,
            modes_tested: reports.len(),
            reports,
        })
    }
}

/// Report from a certification run
#[derive(Debug, Clone)]
pub struct CertificationReport {
    pub passed: bool,
    pub total_violations: usize,
    pub modes_tested: usize,
    pub reports: Vec<SimulatorReport>,
}
