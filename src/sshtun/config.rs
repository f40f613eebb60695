use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::sshtun::{
    endpoint::Endpoint,
    relay::RelayOptions,
    tunnel::transport::{AuthConfig, AuthMethod, HostVerification},
};

const DEFAULT_SERVER_PORT: u16 = 22;
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// Listen locally, reach the remote target through the SSH server.
    #[default]
    Forward,
    /// Have the SSH server listen on the remote address, reach the local target directly.
    Reverse,
}

impl std::fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelMode::Forward => write!(f, "forward"),
            TunnelMode::Reverse => write!(f, "reverse"),
        }
    }
}

/// Command-line surface. Every flag can also come from an `SSHTUN_*` variable.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct CliArgs {
    /// Optional config file (.toml/.yaml/.yml). Flags override values from it.
    #[arg(long, env = "SSHTUN_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, env = "SSHTUN_MODE")]
    pub mode: Option<TunnelMode>,

    /// SSH user name.
    #[arg(long, env = "SSHTUN_USER")]
    pub user: Option<String>,

    /// SSH password.
    #[arg(long = "pass", visible_alias = "secret", env = "SSHTUN_PASS", hide_env_values = true)]
    pub secret: Option<String>,

    /// Private key used instead of the password.
    #[arg(long, env = "SSHTUN_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    #[arg(long, env = "SSHTUN_KEY_PASSPHRASE", hide_env_values = true)]
    pub key_passphrase: Option<String>,

    /// Local host (listen address in forward mode, target in reverse mode).
    #[arg(long, env = "SSHTUN_LOCAL")]
    pub local: Option<String>,

    #[arg(long, alias = "localPort", env = "SSHTUN_LOCAL_PORT")]
    pub local_port: Option<u16>,

    /// SSH server host.
    #[arg(long, alias = "sshServer", env = "SSHTUN_SSH_SERVER")]
    pub ssh_server: Option<String>,

    /// SSH server port [default: 22].
    #[arg(long, alias = "serverPort", env = "SSHTUN_SERVER_PORT")]
    pub server_port: Option<u16>,

    /// Remote host as seen from the SSH server (target in forward mode, listen address in reverse mode).
    #[arg(long, env = "SSHTUN_REMOTE")]
    pub remote: Option<String>,

    #[arg(long, alias = "remotePort", env = "SSHTUN_REMOTE_PORT")]
    pub remote_port: Option<u16>,

    /// Skip server host key verification.
    #[arg(long, env = "SSHTUN_INSECURE")]
    pub insecure: bool,

    /// known_hosts file used for host key verification [default: ~/.ssh/known_hosts].
    #[arg(long, env = "SSHTUN_KNOWN_HOSTS")]
    pub known_hosts: Option<PathBuf>,

    #[arg(long, env = "SSHTUN_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("config: missing required value: {0}")]
    Missing(&'static str),
    #[error("config: invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

/// Everything a tunnel driver needs, fixed at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub mode: TunnelMode,
    pub local: Endpoint,
    pub server: Endpoint,
    pub remote: Endpoint,
    pub auth: AuthConfig,
    /// Zero disables the timeout.
    pub dial_timeout: Duration,
    pub relay: RelayOptions,
    pub keepalive_interval: Duration,
    pub metrics_addr: Option<SocketAddr>,
    pub logging: LoggingConfig,
}

impl TunnelConfig {
    /// Checks that every required field is present before any socket is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.user.trim().is_empty() {
            return Err(ConfigError::Missing("user"));
        }
        match &self.auth.method {
            AuthMethod::Password(secret) if secret.is_empty() => {
                return Err(ConfigError::Missing("secret"));
            }
            AuthMethod::Key { path, .. } if path.as_os_str().is_empty() => {
                return Err(ConfigError::Missing("key_file"));
            }
            _ => {}
        }

        let endpoints = [
            (&self.local, "local", "local_port"),
            (&self.server, "ssh_server", "server_port"),
            (&self.remote, "remote", "remote_port"),
        ];
        for (ep, host_field, port_field) in endpoints {
            if ep.is_set() {
                continue;
            }
            if ep.host.trim().is_empty() {
                return Err(ConfigError::Missing(host_field));
            }
            if ep.port == 0 {
                return Err(ConfigError::Missing(port_field));
            }
        }

        if self.relay.buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    mode: Option<TunnelMode>,
    user: Option<String>,
    secret: Option<String>,
    key_file: Option<PathBuf>,
    key_passphrase: Option<String>,

    local_host: Option<String>,
    local_port: Option<u16>,
    server_host: Option<String>,
    server_port: Option<u16>,
    remote_host: Option<String>,
    remote_port: Option<u16>,

    /// `strict` (default) or `insecure`.
    host_key_check: Option<String>,
    known_hosts: Option<PathBuf>,

    dial_timeout_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
    buffer_size: Option<usize>,
    keepalive_interval_ms: Option<u64>,
    metrics_addr: Option<String>,

    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn load_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    };
    Ok(fc)
}

/// Builds the validated tunnel configuration from flags and the optional config file.
///
/// Validation failures come back as a [`ConfigError`] inside the `anyhow::Error`
/// so the caller can report them as usage errors.
pub fn load(cli: &CliArgs) -> anyhow::Result<TunnelConfig> {
    let fc = match &cli.config {
        Some(path) => load_file_config(path)
            .with_context(|| format!("load config: {}", path.display()))?,
        None => FileConfig::default(),
    };
    let cfg = merge(cli, fc)?;
    cfg.validate()?;
    Ok(cfg)
}

fn merge(cli: &CliArgs, fc: FileConfig) -> Result<TunnelConfig, ConfigError> {
    let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    let user = non_empty(cli.user.clone()).or(non_empty(fc.user)).unwrap_or_default();
    let key_file = cli
        .key_file
        .clone()
        .or(fc.key_file)
        .filter(|p| !p.as_os_str().is_empty());
    let method = match key_file {
        Some(path) => AuthMethod::Key {
            path,
            passphrase: cli.key_passphrase.clone().or(fc.key_passphrase),
        },
        None => AuthMethod::Password(cli.secret.clone().or(fc.secret).unwrap_or_default()),
    };

    let insecure = cli.insecure
        || match fc.host_key_check.as_deref().map(str::trim) {
            None | Some("") | Some("strict") => false,
            Some("insecure") => true,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    field: "host_key_check",
                    reason: format!("{other:?} (expected strict or insecure)"),
                });
            }
        };
    let host_verification = if insecure {
        HostVerification::Insecure
    } else {
        HostVerification::Strict {
            known_hosts: cli.known_hosts.clone().or(fc.known_hosts),
        }
    };

    let local = Endpoint::new(
        non_empty(cli.local.clone()).or(non_empty(fc.local_host)).unwrap_or_default(),
        cli.local_port.or(fc.local_port).unwrap_or(0),
    );
    let server = Endpoint::new(
        non_empty(cli.ssh_server.clone())
            .or(non_empty(fc.server_host))
            .unwrap_or_default(),
        cli.server_port.or(fc.server_port).unwrap_or(DEFAULT_SERVER_PORT),
    );
    let remote = Endpoint::new(
        non_empty(cli.remote.clone()).or(non_empty(fc.remote_host)).unwrap_or_default(),
        cli.remote_port.or(fc.remote_port).unwrap_or(0),
    );

    let metrics_addr = match non_empty(fc.metrics_addr) {
        Some(s) => Some(s.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
            field: "metrics_addr",
            reason: format!("{s:?}: {e}"),
        })?),
        None => None,
    };

    let mut logging = LoggingConfig::default();
    if let Some(fl) = fc.logging {
        if let Some(v) = non_empty(fl.level) {
            logging.level = v;
        }
        if let Some(v) = non_empty(fl.format) {
            logging.format = v;
        }
        if let Some(v) = non_empty(fl.output) {
            logging.output = v;
        }
        logging.add_source = fl.add_source;
    }
    if let Some(v) = non_empty(cli.log_level.clone()) {
        logging.level = v;
    }

    Ok(TunnelConfig {
        mode: cli.mode.or(fc.mode).unwrap_or_default(),
        local,
        server,
        remote,
        auth: AuthConfig {
            user,
            method,
            host_verification,
        },
        dial_timeout: fc
            .dial_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DIAL_TIMEOUT),
        relay: RelayOptions {
            buffer_size: fc.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            idle_timeout: Duration::from_millis(fc.idle_timeout_ms.unwrap_or(0)),
        },
        keepalive_interval: fc
            .keepalive_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL),
        metrics_addr,
        logging,
    })
}

#[cfg(test)]
impl TunnelConfig {
    /// A complete configuration pointing at loopback addresses.
    pub fn for_tests(mode: TunnelMode, local: Endpoint, remote: Endpoint) -> Self {
        TunnelConfig {
            mode,
            local,
            server: Endpoint::new("ssh.test", DEFAULT_SERVER_PORT),
            remote,
            auth: AuthConfig {
                user: "tester".into(),
                method: AuthMethod::Password("hunter2".into()),
                host_verification: HostVerification::Insecure,
            },
            dial_timeout: Duration::from_secs(2),
            relay: RelayOptions::default(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            metrics_addr: None,
            logging: LoggingConfig::default(),
        }
    }
}
