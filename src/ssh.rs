//! SSH transport on `russh`: public-key auth, host key checked against a
//! known_hosts file, connect bounded by the configured timeout.
use crate::config::{split_addr, MonitorConfig};
use crate::transport::{
    BoxError, ConnectError, RemoteOutput, RemoteSession, StartError, Transport,
};
use russh::client;
use russh::keys::{self, PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Problems found while preparing the transport, before any connection.
#[derive(Debug)]
pub enum SetupError {
    /// Private key could not be read or decoded.
    Key { path: PathBuf, source: keys::Error },
    /// Trust store is missing or unreadable.
    KnownHosts {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::Key { path, source } => {
                write!(f, "failed to load private key {}: {}", path.display(), source)
            }
            SetupError::KnownHosts { path, source } => {
                write!(f, "failed to open known_hosts {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::Key { source, .. } => Some(source),
            SetupError::KnownHosts { source, .. } => Some(source),
        }
    }
}

/// Connects with a key loaded once at startup.
pub struct SshTransport {
    key: Arc<PrivateKey>,
    client_config: Arc<client::Config>,
}

impl SshTransport {
    /// Load the private key and make sure the trust store is readable.
    pub fn new(config: &MonitorConfig) -> Result<Self, SetupError> {
        std::fs::metadata(&config.known_hosts).map_err(|e| SetupError::KnownHosts {
            path: config.known_hosts.clone(),
            source: e,
        })?;
        let key = keys::load_secret_key(&config.key, None).map_err(|e| SetupError::Key {
            path: config.key.clone(),
            source: e,
        })?;
        tracing::debug!(
            key = %config.key.display(),
            algorithm = %key.algorithm(),
            "loaded private key"
        );
        Ok(Self {
            key: Arc::new(key),
            client_config: Arc::new(client::Config::default()),
        })
    }
}

/// Accepts the server only if known_hosts lists its key for this host:port.
struct KnownHostsCheck {
    host: String,
    port: u16,
    known_hosts: PathBuf,
}

impl client::Handler for KnownHostsCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(host_key_trusted(
            &self.host,
            self.port,
            server_public_key,
            &self.known_hosts,
        ))
    }
}

fn host_key_trusted(
    host: &str,
    port: u16,
    key: &keys::ssh_key::PublicKey,
    known_hosts: &Path,
) -> bool {
    match keys::check_known_hosts_path(host, port, key, known_hosts) {
        Ok(true) => true,
        Ok(false) => {
            tracing::warn!(host, port, "host key not present in known_hosts");
            false
        }
        Err(e) => {
            tracing::warn!(host, port, error = %e, "host key verification failed");
            false
        }
    }
}

fn classify(addr: &str, user: &str, error: russh::Error) -> ConnectError {
    match error {
        russh::Error::UnknownKey => ConnectError::HostKeyRejected {
            addr: addr.to_string(),
        },
        russh::Error::NotAuthenticated => ConnectError::AuthRejected {
            addr: addr.to_string(),
            user: user.to_string(),
        },
        other => ConnectError::Transport {
            addr: addr.to_string(),
            source: Box::new(other),
        },
    }
}

impl Transport for SshTransport {
    type Session = SshSession;

    async fn connect(&self, config: &MonitorConfig) -> Result<SshSession, ConnectError> {
        let addr = config.addr.as_str();
        let user = config.user.as_str();
        let (host, port) = split_addr(addr).ok_or_else(|| ConnectError::Transport {
            addr: addr.to_string(),
            source: "address is not host:port".into(),
        })?;
        let check = KnownHostsCheck {
            host: host.to_string(),
            port,
            known_hosts: config.known_hosts.clone(),
        };

        let handshake = async {
            let mut handle =
                client::connect(Arc::clone(&self.client_config), addr.to_string(), check).await?;
            let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
            let auth = handle
                .authenticate_publickey(
                    user,
                    PrivateKeyWithHashAlg::new(Arc::clone(&self.key), hash_alg),
                )
                .await?;
            Ok::<_, russh::Error>((handle, auth.success()))
        };

        match tokio::time::timeout(config.connect_timeout, handshake).await {
            Err(_) => Err(ConnectError::TimedOut {
                addr: addr.to_string(),
                after: config.connect_timeout,
            }),
            Ok(Err(e)) => Err(classify(addr, user, e)),
            Ok(Ok((_, false))) => Err(ConnectError::AuthRejected {
                addr: addr.to_string(),
                user: user.to_string(),
            }),
            Ok(Ok((handle, true))) => {
                tracing::debug!(addr, user, "ssh session established");
                Ok(SshSession {
                    handle,
                    reply_timeout: config.connect_timeout,
                })
            }
        }
    }
}

/// Established SSH connection owned by one attempt.
pub struct SshSession {
    handle: client::Handle<KnownHostsCheck>,
    /// How long the server may take to answer the exec request.
    reply_timeout: Duration,
}

/// Meaning of one channel message received while waiting for the exec reply.
#[derive(Debug, PartialEq, Eq)]
enum ExecReply {
    Accepted,
    /// Output arrived before the reply, so the command is running.
    EarlyOutput(Vec<u8>),
    Rejected(&'static str),
    /// Unrelated to the request (window adjust, extended data, ...).
    Pending,
}

fn exec_reply(msg: Option<ChannelMsg>) -> ExecReply {
    match msg {
        Some(ChannelMsg::Success) => ExecReply::Accepted,
        Some(ChannelMsg::Data { data }) => ExecReply::EarlyOutput(data.to_vec()),
        Some(ChannelMsg::Failure) => ExecReply::Rejected("exec request rejected by server"),
        Some(ChannelMsg::Close) | None => ExecReply::Rejected("channel closed before exec reply"),
        Some(_) => ExecReply::Pending,
    }
}

impl RemoteSession for SshSession {
    async fn start_command(&mut self, command: &str) -> Result<RemoteOutput, StartError> {
        let start_error = |source: BoxError| StartError {
            command: command.to_string(),
            source,
        };
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| start_error(Box::new(e)))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| start_error(Box::new(e)))?;

        let reply = async {
            loop {
                match exec_reply(channel.wait().await) {
                    ExecReply::Pending => continue,
                    reply => return reply,
                }
            }
        };
        let early = match tokio::time::timeout(self.reply_timeout, reply).await {
            Err(_) => {
                return Err(start_error(
                    format!(
                        "no reply to exec request within {}s",
                        self.reply_timeout.as_secs()
                    )
                    .into(),
                ))
            }
            Ok(ExecReply::Rejected(reason)) => return Err(start_error(reason.into())),
            Ok(ExecReply::EarlyOutput(data)) => data,
            Ok(ExecReply::Accepted | ExecReply::Pending) => Vec::new(),
        };
        tracing::debug!(command, early_bytes = early.len(), "exec request accepted");

        Ok(Box::new(Cursor::new(early).chain(channel.into_stream())))
    }

    /// Disconnecting ends every channel on the connection, which in turn
    /// makes a pending read on the command output return EOF.
    async fn close(self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            tracing::debug!(error = %e, "ssh disconnect failed");
        }
    }
}
