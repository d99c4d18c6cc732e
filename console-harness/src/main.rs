use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use console_harness::emulator::{AlwaysAlive, Emulator, EmulatorSpec, Liveness, SerialRedirect};
use console_harness::suite::{default_suite, filter_categories, load_suite};
use console_harness::transport::{InjectedConsole, LogTail, QemuMonitor, TcpSerial, VBoxManage};
use console_harness::{run_suite, HarnessConfig, HarnessError, Reporter, RunOutcome, TestCase};

/// Exit code for `--strict` runs where some test did not pass.
const EXIT_NOT_ALL_PASSED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// Serial port proxied over TCP
    Tcp,
    /// Keys injected out of band, output read from the serial log file
    LogTail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum InjectorKind {
    QemuMonitor,
    Vbox,
}

#[derive(Parser)]
#[command(name = "console-harness", about = "Run a command suite against a kernel's serial shell")]
struct Cli {
    /// Boot media; if it does not exist, attach to a running target instead
    #[arg(short, long, default_value = "trustos.iso")]
    media: PathBuf,

    /// How commands reach the target
    #[arg(long, value_enum, default_value = "tcp")]
    transport: TransportKind,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Serial TCP port
    #[arg(short, long, default_value = "5555")]
    port: u16,

    /// QEMU monitor port (log-tail transport)
    #[arg(long, default_value = "5556")]
    monitor_port: u16,

    /// Serial log file (log-tail transport)
    #[arg(long, default_value = "serial.log")]
    log_file: PathBuf,

    /// Key injector (log-tail transport)
    #[arg(long, value_enum, default_value = "qemu-monitor")]
    injector: InjectorKind,

    /// VirtualBox VM name (vbox injector)
    #[arg(long, default_value = "TrustOS")]
    vm_name: String,

    /// Never launch an emulator; use the target that is already running
    #[arg(long)]
    attach: bool,

    /// Boot timeout in seconds
    #[arg(long)]
    boot_timeout: Option<u64>,

    /// Per-command timeout in seconds
    #[arg(long)]
    command_timeout: Option<u64>,

    /// Text report path
    #[arg(short, long, default_value = "console-report.txt")]
    report: PathBuf,

    /// Also write a JSON report here
    #[arg(long)]
    json: Option<PathBuf>,

    /// Harness configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Test suite (JSON); the built-in smoke suite is used otherwise
    #[arg(short, long)]
    suite: Option<PathBuf>,

    /// Only run these categories (repeatable)
    #[arg(long = "category")]
    categories: Vec<String>,

    /// Exit with status 3 unless every executed test passed
    #[arg(long)]
    strict: bool,
}

impl Cli {
    fn load_config(&self) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => HarnessConfig::default(),
        };
        if let Some(secs) = self.boot_timeout {
            config.timings.boot_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.command_timeout {
            config.timings.command_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    fn load_cases(&self) -> Result<Vec<TestCase>> {
        let cases = match &self.suite {
            Some(path) => load_suite(path).with_context(|| format!("loading {}", path.display()))?,
            None => default_suite(),
        };
        let cases = filter_categories(cases, &self.categories);
        if cases.is_empty() {
            bail!("no tests in categories {:?}", self.categories);
        }
        Ok(cases)
    }

    /// VirtualBox targets are always external.
    fn attaching(&self) -> bool {
        self.attach
            || (self.transport == TransportKind::LogTail && self.injector == InjectorKind::Vbox)
            || !self.media.is_file()
    }

    fn emulator_spec(&self) -> EmulatorSpec {
        let serial = match self.transport {
            TransportKind::Tcp => SerialRedirect::Tcp { port: self.port },
            TransportKind::LogTail => SerialRedirect::File {
                path: self.log_file.clone(),
                monitor_port: self.monitor_port,
            },
        };
        EmulatorSpec::new(&self.media, serial)
    }
}

async fn connect_and_run(
    cli: &Cli,
    config: &HarnessConfig,
    cases: &[TestCase],
    liveness: &mut dyn Liveness,
) -> Result<RunOutcome> {
    let t = &config.timings;
    let outcome = match cli.transport {
        TransportKind::Tcp => {
            let addr = format!("{}:{}", cli.host, cli.port);
            let serial = TcpSerial::connect(&addr, t.connect_attempts, t.connect_spacing)
                .await
                .map_err(HarnessError::Connect)?;
            run_suite(serial, config, cases, liveness).await?
        }
        TransportKind::LogTail => {
            let tail = if cli.attaching() {
                LogTail::from_end(&cli.log_file)
                    .await
                    .with_context(|| format!("opening {}", cli.log_file.display()))?
            } else {
                LogTail::new(&cli.log_file)
            };
            match cli.injector {
                InjectorKind::QemuMonitor => {
                    let addr = format!("{}:{}", cli.host, cli.monitor_port);
                    let monitor = QemuMonitor::connect(&addr, t.connect_attempts, t.connect_spacing)
                        .await
                        .map_err(HarnessError::Connect)?;
                    run_suite(InjectedConsole::new(monitor, tail), config, cases, liveness).await?
                }
                InjectorKind::Vbox => {
                    let vbox = VBoxManage::locate(&cli.vm_name).map_err(HarnessError::Connect)?;
                    run_suite(InjectedConsole::new(vbox, tail), config, cases, liveness).await?
                }
            }
        }
    };
    Ok(outcome)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let config = cli.load_config()?;
    let cases = cli.load_cases()?;

    let mut emulator = if cli.attaching() {
        tracing::info!(media = %cli.media.display(), "Attaching to running target");
        None
    } else {
        Some(Emulator::launch(&cli.emulator_spec())?)
    };

    tracing::info!(
        transport = ?cli.transport,
        tests = cases.len(),
        boot_timeout = ?config.timings.boot_timeout,
        "Starting console test run"
    );

    let mut always = AlwaysAlive;
    let liveness: &mut dyn Liveness = match emulator.as_mut() {
        Some(emu) => emu as &mut dyn Liveness,
        None => &mut always,
    };
    let outcome = connect_and_run(&cli, &config, &cases, liveness).await?;

    let reporter = Reporter::new(&outcome.info, &outcome.recorder);
    reporter.print_console(std::io::stdout().is_terminal());
    reporter.write_text(&cli.report)?;
    if let Some(path) = &cli.json {
        reporter.write_json(path)?;
    }

    if let Some(emu) = emulator {
        emu.shutdown().await?;
    }

    if cli.strict && !outcome.recorder.all_passed() {
        return Ok(ExitCode::from(EXIT_NOT_ALL_PASSED));
    }
    Ok(ExitCode::SUCCESS)
}
