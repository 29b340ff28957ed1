//! backup-authd - authenticates director, storage, file node and console connections.

use std::env;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use backup_authd::auth::JobKeyRegistry;
use backup_authd::config::Settings;
use backup_authd::socket::{accepts_connections, SocketListener};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const NAME: &str = env!("CARGO_PKG_NAME");
const DEFAULT_CONFIG: &str = "/etc/backup-authd/daemon.toml";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const USAGE: &str = "\
Usage: backup-authd [-c PATH] [-t]

  -c, --config PATH   configuration file (default /etc/backup-authd/daemon.toml)
  -t, --test-config   check the configuration and exit
  -h, --help          show this text
  -V, --version       show the version";

/// What the command line asked for.
enum Command {
    Run { config: String },
    TestConfig { config: String },
    Help,
    Version,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command, String> {
    let mut config = DEFAULT_CONFIG.to_string();
    let mut test_only = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-V" | "--version" => return Ok(Command::Version),
            "-t" | "--test-config" => test_only = true,
            "-c" | "--config" => {
                config = args
                    .next()
                    .ok_or_else(|| format!("{} needs a path", arg))?;
            }
            other => match other.strip_prefix("--config=") {
                Some(path) => config = path.to_string(),
                None => return Err(format!("unknown argument: {}", other)),
            },
        }
    }

    Ok(if test_only {
        Command::TestConfig { config }
    } else {
        Command::Run { config }
    })
}

fn main() -> ExitCode {
    let config = match parse_args(env::args().skip(1)) {
        Ok(Command::Help) => {
            println!("{} {}\n\n{}", NAME, VERSION, USAGE);
            return ExitCode::SUCCESS;
        }
        Ok(Command::Version) => {
            println!("{} {}", NAME, VERSION);
            return ExitCode::SUCCESS;
        }
        Ok(Command::TestConfig { config }) => {
            return match Settings::load(&config) {
                Ok(settings) => {
                    println!(
                        "{}: {} {} with {} peers",
                        config,
                        settings.daemon.class,
                        settings.daemon.name,
                        settings.peers.len()
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}: {}", config, e);
                    ExitCode::FAILURE
                }
            };
        }
        Ok(Command::Run { config }) => config,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            return ExitCode::from(2);
        }
    };

    let settings = match Settings::load(&config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&settings) {
        eprintln!("Error initializing logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        version = VERSION,
        config = %config,
        name = %settings.daemon.name,
        class = %settings.daemon.class,
        "Starting {}",
        NAME
    );

    if !accepts_connections(settings.daemon.class) {
        error!(class = %settings.daemon.class, "This daemon class does not accept connections");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(settings, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Daemon failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve(settings: Settings, config: String) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = Arc::new(JobKeyRegistry::new());
    let listener = SocketListener::bind(&settings, jobs).await?;
    let mut signals = Signals::install()?;
    let shutdown = Arc::new(Notify::new());

    let run = listener.run(Arc::clone(&shutdown));
    tokio::pin!(run);

    loop {
        tokio::select! {
            result = &mut run => {
                result?;
                break;
            }
            event = signals.next() => match event {
                Signal::Reload => match Settings::load(&config) {
                    Ok(new_settings) => listener.reload(&new_settings),
                    Err(e) => error!(error = %e, "Reload failed, keeping current peers"),
                },
                Signal::Shutdown => {
                    info!("Shutting down, waiting for running handshakes");
                    shutdown.notify_waiters();
                    if tokio::time::timeout(DRAIN_TIMEOUT, listener.wait_for_drain())
                        .await
                        .is_err()
                    {
                        warn!(
                            timeout_secs = DRAIN_TIMEOUT.as_secs(),
                            "Handshakes still running at shutdown"
                        );
                    }
                    break;
                }
            },
        }
    }

    info!("Daemon stopped");
    Ok(())
}

enum Signal {
    Shutdown,
    Reload,
}

/// SIGINT and SIGTERM stop the daemon, SIGHUP reloads its peers.
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

impl Signals {
    fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn next(&mut self) -> Signal {
        tokio::select! {
            _ = self.interrupt.recv() => Signal::Shutdown,
            _ = self.terminate.recv() => Signal::Shutdown,
            _ = self.hangup.recv() => Signal::Reload,
        }
    }
}

fn init_logging(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    let registry = tracing_subscriber::registry().with(env_filter);

    if settings.logging.format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).try_init()?;
    } else {
        registry.with(fmt::layer().pretty()).try_init()?;
    }
    Ok(())
}
