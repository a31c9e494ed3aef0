use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use swap_agent::config::AgentConfig;
use swap_agent::logging;
use swap_agent::protocol::{ChangeSet, ClassDefinition, Request, Response, Status};
use swap_agent::test_harness::{run_simulator, SimulatorConfig, SwapMode, TestHarness};
use swap_agent::transport::{read_frame_async, write_frame_async, TransportError};
use swap_payload::Payload;

/// Why a control exchange ended without an `OK`
#[derive(Debug, thiserror::Error)]
enum ControlFailure {
    #[error("no agent connected within {0:?}")]
    NoAgent(Duration),

    #[error("agent closed the connection without a response")]
    ClosedWithoutResponse,

    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),

    #[error("swap failed: {0}")]
    Rejected(String),
}

impl ControlFailure {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Rejected(_) => 1,
            Self::ClosedWithoutResponse => 2,
            Self::ResponseTimeout(_) | Self::NoAgent(_) => 3,
        }
    }
}

fn cli() -> Command {
    Command::new("swap-agent")
        .version(swap_agent::VERSION)
        .about("Attach-time code swap agent: simulator and controller tools")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Agent configuration file (TOML)"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run repeated attaches against a simulated process")
                .arg(
                    Arg::new("attaches")
                        .long("attaches")
                        .default_value("10")
                        .value_parser(value_parser!(u64))
                        .help("Number of attaches to simulate"),
                )
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .default_value("immediate")
                        .value_parser(["immediate", "restart", "reject"])
                        .help("Path every request takes"),
                )
                .arg(
                    Arg::new("payload")
                        .long("payload")
                        .value_parser(value_parser!(PathBuf))
                        .help("Payload file the simulated agent carries (default: a built-in one)"),
                )
                .arg(
                    Arg::new("payload-dir")
                        .long("payload-dir")
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory for the payload file (default: a temporary one)"),
                )
                .arg(
                    Arg::new("stop-on-violation")
                        .long("stop-on-violation")
                        .action(ArgAction::SetTrue)
                        .help("Stop simulation on first violation"),
                ),
        )
        .subcommand(
            Command::new("certify")
                .about("Run the simulator in every mode")
                .arg(
                    Arg::new("attaches")
                        .long("attaches")
                        .default_value("25")
                        .value_parser(value_parser!(u64))
                        .help("Attaches per mode"),
                ),
        )
        .subcommand(
            Command::new("control")
                .about("Act as the controller: wait for one agent and send it a swap request")
                .arg(
                    Arg::new("socket")
                        .long("socket")
                        .value_parser(value_parser!(PathBuf))
                        .help("Socket to listen on (default: from configuration)"),
                )
                .arg(
                    Arg::new("package")
                        .long("package")
                        .required(true)
                        .help("Application package name"),
                )
                .arg(
                    Arg::new("class")
                        .long("class")
                        .action(ArgAction::Append)
                        .help("Class to redefine, as NAME=FILE"),
                )
                .arg(
                    Arg::new("restart")
                        .long("restart")
                        .action(ArgAction::SetTrue)
                        .help("Defer the swap until the next activity restart"),
                )
                .arg(
                    Arg::new("accept-timeout-ms")
                        .long("accept-timeout-ms")
                        .default_value("30000")
                        .value_parser(value_parser!(u64))
                        .help("How long to wait for the agent to connect"),
                )
                .arg(
                    Arg::new("response-timeout-ms")
                        .long("response-timeout-ms")
                        .default_value("60000")
                        .value_parser(value_parser!(u64))
                        .help("How long to wait for each response"),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<AgentConfig> {
    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AgentConfig::new(),
    };
    Ok(config.from_env()?)
}

fn parse_class(arg: &str) -> anyhow::Result<ClassDefinition> {
    let (name, file) = arg
        .split_once('=')
        .with_context(|| format!("expected NAME=FILE, got {arg}"))?;
    let bytecode = std::fs::read(file).with_context(|| format!("reading {file}"))?;
    Ok(ClassDefinition {
        name: name.to_string(),
        bytecode,
    })
}

fn simulate(args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let attaches = args.get_one::<u64>("attaches").copied().unwrap_or(10);
    let mode = args
        .get_one::<String>("mode")
        .map_or(Ok(SwapMode::Immediate), |m| m.parse::<SwapMode>())
        .map_err(anyhow::Error::msg)?;

    let payload = args
        .get_one::<PathBuf>("payload")
        .map(|path| Payload::from_file(path).with_context(|| format!("reading {}", path.display())))
        .transpose()?;

    println!("Running swap agent simulator...");
    println!("Attaches: {attaches}");
    println!("Mode: {mode}");
    println!();

    let report = run_simulator(SimulatorConfig {
        attaches,
        mode,
        payload,
        payload_dir: args.get_one::<PathBuf>("payload-dir").cloned(),
        stop_on_first_violation: args.get_flag("stop-on-violation"),
        ..SimulatorConfig::default()
    })?;
    println!("{}", report.generate_text());
    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn certify(args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let attaches = args.get_one::<u64>("attaches").copied().unwrap_or(25);
    println!("Running certification suite...");
    println!();

    let report = TestHarness::run_certification(attaches)?;
    for mode_report in &report.reports {
        println!("{}", mode_report.generate_text());
    }
    println!("Certification Report:");
    println!("  Modes Tested: {}", report.modes_tested);
    println!("  Total Violations: {}", report.total_violations);
    println!("  Status: {}", if report.passed { "PASSED" } else { "FAILED" });
    Ok(if report.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(unix)]
async fn control(args: &ArgMatches, config: &AgentConfig) -> anyhow::Result<Result<(), ControlFailure>> {
    use tokio::net::UnixListener;
    use tokio::time::timeout;

    let socket = args
        .get_one::<PathBuf>("socket")
        .cloned()
        .unwrap_or_else(|| config.socket_path.clone());
    let accept_timeout = Duration::from_millis(*args.get_one::<u64>("accept-timeout-ms").unwrap_or(&30_000));
    let response_timeout =
        Duration::from_millis(*args.get_one::<u64>("response-timeout-ms").unwrap_or(&60_000));

    let classes = args
        .get_many::<String>("class")
        .into_iter()
        .flatten()
        .map(|arg| parse_class(arg))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let request = Request {
        package_name: args.get_one::<String>("package").cloned().unwrap_or_default(),
        restart_activity: args.get_flag("restart"),
        change_set: ChangeSet { classes },
    };

    if socket.exists() {
        std::fs::remove_file(&socket).with_context(|| format!("removing stale {}", socket.display()))?;
    }
    let listener = UnixListener::bind(&socket).with_context(|| format!("binding {}", socket.display()))?;
    tracing::info!(socket = %socket.display(), "waiting for agent");

    let Ok(accepted) = timeout(accept_timeout, listener.accept()).await else {
        return Ok(Err(ControlFailure::NoAgent(accept_timeout)));
    };
    let (mut stream, _) = accepted.context("accepting agent connection")?;

    write_frame_async(&mut stream, &request.encode()?).await?;

    loop {
        let frame = match timeout(response_timeout, read_frame_async(&mut stream)).await {
            Err(_) => return Ok(Err(ControlFailure::ResponseTimeout(response_timeout))),
            Ok(Err(TransportError::Closed)) => return Ok(Err(ControlFailure::ClosedWithoutResponse)),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(frame)) => frame,
        };
        let response = Response::decode(&frame)?;
        println!("pid {}: {:?}", response.pid, response.status);
        if response.status.is_interim() {
            println!("Waiting for the activity to restart...");
            continue;
        }
        if response.status == Status::Ok {
            return Ok(Ok(()));
        }
        let detail = response
            .error_detail
            .map(|d| format!("{}: {}", d.kind, d.message))
            .unwrap_or_default();
        return Ok(Err(ControlFailure::Rejected(detail)));
    }
}

#[cfg(not(unix))]
async fn control(_args: &ArgMatches, _config: &AgentConfig) -> anyhow::Result<Result<(), ControlFailure>> {
    anyhow::bail!("control needs Unix-domain sockets")
}

async fn run(matches: ArgMatches) -> anyhow::Result<ExitCode> {
    let config = load_config(&matches)?;
    logging::init(&config.log);

    match matches.subcommand() {
        Some(("simulate", args)) => simulate(args),
        Some(("certify", args)) => certify(args),
        Some(("control", args)) => match control(args, &config).await? {
            Ok(()) => Ok(ExitCode::SUCCESS),
            Err(failure) => {
                eprintln!("{failure}");
                Ok(ExitCode::from(failure.exit_code()))
            }
        },
        _ => {
            cli().print_help()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(cli().get_matches()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
