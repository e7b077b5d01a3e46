//! Single probe lifecycle: connect, start the remote command, watch its
//! output for liveness, release the session.
use crate::config::MonitorConfig;
use crate::transport::{ConnectError, RemoteSession, StartError, Transport};
use crate::watchdog::{self, WatchExit, Watchdog, SIGNAL_CHANNEL_CAPACITY};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

/// Why an attempt failed.
#[derive(Debug)]
pub enum AttemptError {
    /// Session could not be established.
    Connect(ConnectError),
    /// Session was up but the remote command would not start.
    Start(StartError),
    /// The output stream stayed silent for a whole idle window.
    Timeout {
        idle_timeout: Duration,
        healthy_signals: u64,
    },
    /// The output stream ended or failed before producing any output.
    StreamError { healthy_signals: u64 },
}

impl AttemptError {
    /// Short classification used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptError::Connect(_) => "connect",
            AttemptError::Start(_) => "start",
            AttemptError::Timeout { .. } => "timeout",
            AttemptError::StreamError { .. } => "stream",
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Connect(e) => write!(f, "connect: {e}"),
            AttemptError::Start(e) => write!(f, "start: {e}"),
            AttemptError::Timeout {
                idle_timeout,
                healthy_signals,
            } => write!(
                f,
                "no response within {}s (after {healthy_signals} healthy reads)",
                idle_timeout.as_secs()
            ),
            AttemptError::StreamError { healthy_signals } => write!(
                f,
                "remote output ended (after {healthy_signals} healthy reads)"
            ),
        }
    }
}

impl std::error::Error for AttemptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AttemptError::Connect(e) => Some(e),
            AttemptError::Start(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectError> for AttemptError {
    fn from(e: ConnectError) -> Self {
        AttemptError::Connect(e)
    }
}

impl From<StartError> for AttemptError {
    fn from(e: StartError) -> Self {
        AttemptError::Start(e)
    }
}

/// Run one attempt against `config`'s target.
///
/// Succeeds when the remote produced output and then either exited or
/// outlasted the attempt budget. An idle window with no output fails even
/// after earlier activity. The session is closed on every path after a
/// successful connect, and the reader task is joined before returning.
pub async fn run_attempt<T: Transport>(
    transport: &T,
    config: &MonitorConfig,
) -> Result<(), AttemptError> {
    let mut session = transport.connect(config).await?;

    let output = match session.start_command(&config.command).await {
        Ok(output) => output,
        Err(e) => {
            session.close().await;
            return Err(e.into());
        }
    };
    tracing::info!(user = %config.user, addr = %config.addr, "session started");

    let (tx, mut rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
    let reader = watchdog::spawn_reader(output, tx);

    let report = Watchdog::new(config.idle_timeout, config.max_attempt)
        .watch(&mut rx)
        .await;

    // Unblock a reader parked on a full channel, then close the stream under
    // a reader parked in `read`.
    drop(rx);
    session.close().await;
    reader.abort();
    if let Err(e) = reader.await {
        if e.is_panic() {
            tracing::warn!(error = %e, "output reader panicked");
        }
    }

    let healthy_signals = report.healthy_signals;
    match report.exit {
        WatchExit::BudgetElapsed | WatchExit::StreamEnded if report.observed_any_healthy() => {
            tracing::info!(
                healthy_signals,
                exit = ?report.exit,
                elapsed_secs = report.elapsed.as_secs(),
                "attempt healthy"
            );
            Ok(())
        }
        WatchExit::BudgetElapsed | WatchExit::IdleTimeout => {
            tracing::warn!(healthy_signals, "idle window elapsed with no remote output");
            Err(AttemptError::Timeout {
                idle_timeout: config.idle_timeout,
                healthy_signals,
            })
        }
        WatchExit::StreamEnded => {
            tracing::warn!("remote command ended without output");
            Err(AttemptError::StreamError { healthy_signals })
        }
    }
}

/// Something the supervisor can invoke once per attempt.
pub trait AttemptRunner {
    fn run_attempt(&mut self) -> impl Future<Output = Result<(), AttemptError>> + Send;
}

/// Binds a transport to a config so each call is one [`run_attempt`].
pub struct Prober<T> {
    transport: T,
    config: MonitorConfig,
}

impl<T: Transport> Prober<T> {
    pub fn new(transport: T, config: MonitorConfig) -> Self {
        Self { transport, config }
    }
}

impl<T: Transport> AttemptRunner for Prober<T> {
    fn run_attempt(&mut self) -> impl Future<Output = Result<(), AttemptError>> + Send {
        run_attempt(&self.transport, &self.config)
    }
}
