//! Seam between the attempt runner and whatever actually reaches the host.
//!
//! The production implementation lives in `ssh`; tests plug in in-memory
//! sessions backed by `tokio::io::duplex`.
use crate::config::MonitorConfig;
use std::future::Future;
use std::time::Duration;
use tokio::io::AsyncRead;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Output of the remote command. Closing the owning session must make a
/// pending `read` return (EOF or error).
pub type RemoteOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Opens authenticated sessions to the configured target.
///
/// Implementations enforce `config.connect_timeout` themselves; callers do
/// not wrap `connect` in a second timeout.
pub trait Transport: Send + Sync {
    type Session: RemoteSession;

    fn connect(
        &self,
        config: &MonitorConfig,
    ) -> impl Future<Output = Result<Self::Session, ConnectError>> + Send;
}

/// One established session, exclusively owned by a single attempt.
pub trait RemoteSession: Send {
    /// Start `command` and hand back its output stream.
    fn start_command(
        &mut self,
        command: &str,
    ) -> impl Future<Output = Result<RemoteOutput, StartError>> + Send;

    /// Tear the session down. Never fails from the caller's point of view.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Failure to establish a session.
#[derive(Debug)]
pub enum ConnectError {
    /// The transport did not finish connecting within the connect timeout.
    TimedOut { addr: String, after: Duration },
    /// The server's host key was missing from, or conflicted with, the trust store.
    HostKeyRejected { addr: String },
    /// The server refused our credentials.
    AuthRejected { addr: String, user: String },
    /// Anything else: DNS, TCP, protocol negotiation.
    Transport { addr: String, source: BoxError },
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::TimedOut { addr, after } => {
                write!(f, "connect to {addr} timed out after {}s", after.as_secs())
            }
            ConnectError::HostKeyRejected { addr } => {
                write!(f, "host key for {addr} not accepted by known_hosts")
            }
            ConnectError::AuthRejected { addr, user } => {
                write!(f, "authentication as {user} rejected by {addr}")
            }
            ConnectError::Transport { addr, source } => {
                write!(f, "connect to {addr}: {source}")
            }
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Transport { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Failure to start the remote command on an established session.
#[derive(Debug)]
pub struct StartError {
    pub command: String,
    pub source: BoxError,
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to start remote command {:?}: {}", self.command, self.source)
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
