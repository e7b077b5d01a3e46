mod attempt;
mod config;
mod retry;
mod signals;
mod ssh;
mod supervisor;
mod transport;
mod watchdog;

use attempt::Prober;
use clap::{CommandFactory, Parser};
use config::{ConfigError, FileConfig, Overrides, DEFAULT_CONFIG_FILE};
use supervisor::{Supervisor, TokioSleeper};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Continuously probe an SSH host for liveness: connect, start a remote
/// command, and fail if its output goes quiet. One failure is retried
/// immediately; two in a row exit non-zero.
#[derive(Parser, Debug)]
#[command(name = "sshealth", version, about)]
pub struct Cli {
    /// Private key file
    #[arg(long, value_name = "PATH")]
    key: Option<PathBuf>,

    /// known_hosts file containing the host keys [default: ~/.ssh/known_hosts]
    #[arg(long, value_name = "PATH")]
    hosts: Option<PathBuf>,

    /// Target as hostname:port
    #[arg(long, value_name = "HOST:PORT")]
    addr: Option<String>,

    /// Remote user [default: sshealth]
    #[arg(long)]
    user: Option<String>,

    /// Config file path [default: sshealth.toml, if present]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Remote command to run (overrides config)
    #[arg(long)]
    command: Option<String>,

    /// Seconds of output silence before an attempt fails (overrides config)
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Seconds allowed to connect and authenticate (overrides config)
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u64>,

    /// Seconds to sleep between resolved iterations (overrides config)
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,

    /// Seconds a healthy attempt may run before it counts as a success
    /// (overrides config) [default: unbounded]
    #[arg(long, value_name = "SECS")]
    max_attempt: Option<u64>,

    /// Validate config and print resolved settings, don't probe
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (per-iteration and watchdog details)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            addr: self.addr.clone(),
            user: self.user.clone(),
            key: self.key.clone(),
            known_hosts: self.hosts.clone(),
            command: self.command.clone(),
            connect_timeout_secs: self.connect_timeout,
            idle_timeout_secs: self.idle_timeout,
            interval_secs: self.interval,
            max_attempt_secs: self.max_attempt,
        }
    }

    fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let (config_path, required) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let file = match FileConfig::load(&config_path, required) {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(error = %e, "config");
            return ExitCode::FAILURE;
        }
    };

    let config = match file.resolve(cli.overrides(), dirs::home_dir()) {
        Ok(config) => config,
        Err(ConfigError::Missing(field)) => {
            tracing::debug!(field, "required setting missing, printing usage");
            if let Err(e) = Cli::command().print_help() {
                tracing::error!(error = %e, "failed to print usage");
            }
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            tracing::error!(error = %e, "config");
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        println!("sshealth v{}", env!("CARGO_PKG_VERSION"));
        println!("{config:#?}");
        println!("Dry run mode: config validated, not probing.");
        return ExitCode::SUCCESS;
    }

    let transport = match ssh::SshTransport::new(&config) {
        Ok(transport) => transport,
        Err(e) => {
            tracing::error!(error = %e, "ssh setup");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        addr = %config.addr,
        user = %config.user,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        interval_secs = config.interval.as_secs(),
        "sshealth starting"
    );

    let mut probe_loop = Supervisor::new(config.addr.clone(), config.user.clone(), config.interval);
    let mut prober = Prober::new(transport, config);
    let mut sleeper = TokioSleeper;

    tokio::select! {
        _fatal = probe_loop.run(&mut prober, &mut sleeper) => ExitCode::FAILURE,
        shutdown = signals::shutdown_signal() => {
            tracing::info!(?shutdown, "shutting down");
            ExitCode::SUCCESS
        }
    }
}
