use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "sshealth.toml";

/// Top-level configuration loaded from sshealth.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct FileConfig {
    pub target: TargetConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub addr: Option<String>,
    pub user: String,
    pub key: Option<PathBuf>,
    pub known_hosts: Option<PathBuf>,
    /// Remote command to exec. Empty means "let the server decide", which is
    /// how a forced `command=` in authorized_keys gets triggered.
    pub command: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub interval_secs: u64,
    /// Upper bound on a single healthy attempt. Unset means the attempt
    /// watches the stream until it goes quiet or ends.
    pub max_attempt_secs: Option<u64>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            addr: None,
            user: "sshealth".to_string(),
            key: None,
            known_hosts: None,
            command: String::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 20,
            idle_timeout_secs: 60,
            interval_secs: 60,
            max_attempt_secs: None,
        }
    }
}

/// Values supplied on the command line. `None` leaves the file value in place.
#[derive(Debug, Default)]
pub struct Overrides {
    pub addr: Option<String>,
    pub user: Option<String>,
    pub key: Option<PathBuf>,
    pub known_hosts: Option<PathBuf>,
    pub command: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub interval_secs: Option<u64>,
    pub max_attempt_secs: Option<u64>,
}

/// Fully resolved, read-only settings for one monitor process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub addr: String,
    pub user: String,
    pub key: PathBuf,
    pub known_hosts: PathBuf,
    pub command: String,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub interval: Duration,
    pub max_attempt: Option<Duration>,
}

#[derive(Debug)]
pub enum ConfigError {
    /// Config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Config file is not valid TOML for [`FileConfig`].
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A required setting was given neither on the CLI nor in the file.
    Missing(&'static str),
    /// No trust store given and the home directory could not be determined.
    NoHomeDir,
    /// A setting is present but unusable.
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Missing(field) => write!(f, "missing required setting `{field}`"),
            ConfigError::NoHomeDir => {
                write!(f, "cannot locate home directory for default known_hosts")
            }
            ConfigError::Invalid { field, reason } => write!(f, "invalid `{field}`: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl FileConfig {
    /// Load a config file. A missing file is only an error when `required`
    /// (i.e. the user named it explicitly).
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Merge CLI overrides over file values and produce the final settings.
    ///
    /// `home` is used only when no known_hosts path was given anywhere.
    pub fn resolve(
        self,
        overrides: Overrides,
        home: Option<PathBuf>,
    ) -> Result<MonitorConfig, ConfigError> {
        let FileConfig { target, timing } = self;

        let key = overrides.key.or(target.key).ok_or(ConfigError::Missing("key"))?;
        let addr = overrides
            .addr
            .or(target.addr)
            .ok_or(ConfigError::Missing("addr"))?;
        validate_addr(&addr)?;

        let known_hosts = match overrides.known_hosts.or(target.known_hosts) {
            Some(path) => path,
            None => home
                .ok_or(ConfigError::NoHomeDir)?
                .join(".ssh")
                .join("known_hosts"),
        };

        let connect_timeout_secs = overrides
            .connect_timeout_secs
            .unwrap_or(timing.connect_timeout_secs);
        let idle_timeout_secs = overrides
            .idle_timeout_secs
            .unwrap_or(timing.idle_timeout_secs);
        let interval_secs = overrides.interval_secs.unwrap_or(timing.interval_secs);

        non_zero("connect_timeout_secs", connect_timeout_secs)?;
        non_zero("idle_timeout_secs", idle_timeout_secs)?;
        let max_attempt_secs = overrides.max_attempt_secs.or(timing.max_attempt_secs);
        if let Some(max) = max_attempt_secs {
            non_zero("max_attempt_secs", max)?;
        }

        Ok(MonitorConfig {
            addr,
            user: overrides.user.unwrap_or(target.user),
            key,
            known_hosts,
            command: overrides.command.unwrap_or(target.command),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            interval: Duration::from_secs(interval_secs),
            max_attempt: max_attempt_secs.map(Duration::from_secs),
        })
    }
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Split `host:port`, accepting bracketed IPv6 (`[::1]:22`).
pub fn split_addr(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

fn validate_addr(addr: &str) -> Result<(), ConfigError> {
    match split_addr(addr) {
        Some(_) => Ok(()),
        None => Err(ConfigError::Invalid {
            field: "addr",
            reason: format!("expected host:port, got {addr:?}"),
        }),
    }
}
