//! Server configuration: built-in defaults + `-D macro=value` overrides.
//!
//! Resolution is a pure function over borrowed inputs. The resolved
//! [`ServerConfig`] is never mutated afterwards; derived values are added with
//! `with_*` methods that return a new snapshot, so resolving twice from the
//! same [`Defaults`] always starts from the same state.

use neubot_core::{NeubotError, NeubotResult};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Macros accepted by `-D`.
pub const VALID_MACROS: [&str; 7] = [
    "server.bittorrent",
    "server.daemonize",
    "server.datadir",
    "server.negotiate",
    "server.raw",
    "server.sapi",
    "server.speedtest",
];

/// The only macro whose value is kept as a string.
const DATADIR: &str = "server.datadir";

pub const USAGE: &str = "\
usage: neubot-server [-dv] [-A address] [-b backend] [-D macro=value]
                     [-u user]

valid backends:
  mlab     Saves results as compressed json files (this is the default)
  null     Do not save results but pretend to do so

valid defines:
  server.bittorrent Set to nonzero to enable BitTorrent server (default: 1)
  server.daemonize  Set to nonzero to run in the background (default: 1)
  server.datadir    Set data directory (default: /var/lib/neubot)
  server.negotiate  Set to nonzero to enable negotiate server (default: 1)
  server.raw        Set to nonzero to enable RAW server (default: 1)
  server.sapi       Set to nonzero to enable nagios API (default: 1)
  server.speedtest  Set to nonzero to enable speedtest server (default: 1)";

/// Value of a single setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Int(i64),
    Text(String),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Int(n) => write!(f, "{n}"),
            SettingValue::Text(s) => f.write_str(s),
        }
    }
}

/// Where collected results go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Mlab,
    Null,
}

impl FromStr for BackendKind {
    type Err = NeubotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mlab" => Ok(BackendKind::Mlab),
            "null" => Ok(BackendKind::Null),
            other => Err(NeubotError::Usage(format!("unknown backend: {other}"))),
        }
    }
}

/// Command-line options as parsed, before validation.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub address: Option<String>,
    pub backend: Option<String>,
    pub defines: Vec<String>,
    pub no_daemon: bool,
    pub user: Option<String>,
    pub verbose: bool,
}

/// Built-in defaults for one entry point (production or development).
#[derive(Debug, Clone)]
pub struct Defaults {
    pub settings: BTreeMap<String, SettingValue>,
    /// Whitespace-separated list of addresses to listen on.
    pub address: String,
    pub unpriv_user: String,
    pub backend: BackendKind,
    pub ports: Vec<u16>,
    pub pidfile: PathBuf,
    pub log_file: PathBuf,
}

impl Defaults {
    /// Defaults of the installed daemon.
    pub fn production() -> Self {
        Self {
            settings: default_settings(Path::new("/var/lib/neubot")),
            address: ":: 0.0.0.0".to_string(),
            unpriv_user: "_neubot".to_string(),
            backend: BackendKind::Mlab,
            // Historically the server runs on 9773 and 8080; 80 is rarely filtered.
            ports: vec![80, 8080, 9773],
            pidfile: PathBuf::from("/var/run/neubot.pid"),
            log_file: PathBuf::from("/var/log/neubot-server.log"),
        }
    }

    /// Defaults for running from a checkout as an ordinary user.
    pub fn development(workdir: &Path, user: String) -> Self {
        Self {
            settings: default_settings(workdir),
            unpriv_user: user,
            ports: vec![8080, 9773],
            pidfile: workdir.join("neubot.pid"),
            log_file: workdir.join("neubot-server.log"),
            ..Self::production()
        }
    }
}

fn default_settings(datadir: &Path) -> BTreeMap<String, SettingValue> {
    let mut settings = BTreeMap::new();
    for name in VALID_MACROS {
        settings.insert(name.to_string(), SettingValue::Int(1));
    }
    settings.insert(
        DATADIR.to_string(),
        SettingValue::Text(datadir.display().to_string()),
    );
    settings
}

/// Resolved, immutable server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    settings: BTreeMap<String, SettingValue>,
    pub address: String,
    pub unpriv_user: String,
    pub backend: BackendKind,
    pub verbose: bool,
    pub ports: Vec<u16>,
    pub pidfile: PathBuf,
    pub log_file: PathBuf,
    /// Root for filesystem serving on the shared listener; `None` disables it.
    pub http_rootdir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn get(&self, name: &str) -> Option<&SettingValue> {
        self.settings.get(name)
    }

    /// Whether a toggle macro is nonzero. Unknown names are disabled.
    pub fn enabled(&self, name: &str) -> bool {
        matches!(self.get(name), Some(SettingValue::Int(n)) if *n != 0)
    }

    pub fn daemonize(&self) -> bool {
        self.enabled("server.daemonize")
    }

    pub fn datadir(&self) -> PathBuf {
        match self.get(DATADIR) {
            Some(value) => PathBuf::from(value.to_string()),
            None => PathBuf::from("."),
        }
    }

    pub fn settings(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.settings.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy of this configuration with a different filesystem root.
    pub fn with_http_rootdir(&self, rootdir: Option<PathBuf>) -> Self {
        Self {
            http_rootdir: rootdir,
            ..self.clone()
        }
    }

    /// Every (address, port) pair to bind, ports outermost.
    pub fn endpoints(&self) -> NeubotResult<Vec<SocketAddr>> {
        let mut endpoints = Vec::new();
        for &port in &self.ports {
            for host in self.address.split_whitespace() {
                let addrs = (host, port).to_socket_addrs().map_err(|e| {
                    NeubotError::Usage(format!("invalid address {host}: {e}"))
                })?;
                endpoints.extend(addrs);
            }
        }
        if endpoints.is_empty() {
            return Err(NeubotError::Usage("no address to listen on".into()));
        }
        Ok(endpoints)
    }
}

/// Merge defaults with the command line.
///
/// `-d` is applied after every `-D`, so it always wins over
/// `-D server.daemonize=1`.
pub fn resolve(cli: &CliOptions, defaults: &Defaults) -> NeubotResult<ServerConfig> {
    let mut settings = defaults.settings.clone();

    for define in &cli.defines {
        let (name, value) = define
            .split_once('=')
            .ok_or_else(|| NeubotError::Usage(format!("malformed define: {define}")))?;
        if !VALID_MACROS.contains(&name) {
            return Err(NeubotError::Usage(format!("unknown macro: {name}")));
        }
        let value = if name == DATADIR {
            SettingValue::Text(value.to_string())
        } else {
            let n = value.trim().parse::<i64>().map_err(|_| {
                NeubotError::Usage(format!("{name} expects an integer, got {value:?}"))
            })?;
            SettingValue::Int(n)
        };
        debug!(name, value = %value, "define");
        settings.insert(name.to_string(), value);
    }

    if cli.no_daemon {
        settings.insert("server.daemonize".to_string(), SettingValue::Int(0));
    }

    let backend = match &cli.backend {
        Some(name) => name.parse()?,
        None => defaults.backend,
    };

    Ok(ServerConfig {
        settings,
        address: cli.address.clone().unwrap_or_else(|| defaults.address.clone()),
        unpriv_user: cli.user.clone().unwrap_or_else(|| defaults.unpriv_user.clone()),
        backend,
        verbose: cli.verbose,
        ports: defaults.ports.clone(),
        pidfile: defaults.pidfile.clone(),
        log_file: defaults.log_file.clone(),
        http_rootdir: None,
    })
}
