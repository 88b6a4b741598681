//! neubot-server: measurement server.
//!
//! Binds its listening ports as root, detaches, drops to an unprivileged
//! user and then serves negotiate/collect requests and the tests that plug
//! into it.

mod backend;
mod bootstrap;
mod config;
mod daemon;
mod dash;
mod event_loop;
mod logging;
mod negotiate;
mod platform;
mod plugins;
mod router;
mod sapi;
mod transport;

use bootstrap::{verify_privileged, Unconfigured};
use clap::error::ErrorKind;
use clap::Parser;
use config::{CliOptions, Defaults, USAGE};
use neubot_core::{NeubotError, NeubotResult};
use platform::SystemPlatform;
use plugins::BuiltinPlugins;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// neubot-server: network measurement server
#[derive(Parser, Debug)]
#[command(name = "neubot-server", version, about = "Neubot measurement server")]
struct Cli {
    /// Whitespace-separated addresses to listen on
    #[arg(short = 'A', value_name = "address")]
    address: Option<String>,

    /// Storage backend (mlab, null)
    #[arg(short = 'b', value_name = "backend")]
    backend: Option<String>,

    /// Override a setting
    #[arg(short = 'D', value_name = "macro=value")]
    defines: Vec<String>,

    /// Stay in the foreground
    #[arg(short = 'd')]
    no_daemon: bool,

    /// Unprivileged user to run as
    #[arg(short = 'u', value_name = "user")]
    user: Option<String>,

    /// Verbose logging
    #[arg(short = 'v')]
    verbose: bool,

    /// Run from the current directory as the invoking user
    #[arg(long, hide = true)]
    development: bool,
}

impl Cli {
    fn options(&self) -> CliOptions {
        CliOptions {
            address: self.address.clone(),
            backend: self.backend.clone(),
            defines: self.defines.clone(),
            no_daemon: self.no_daemon,
            user: self.user.clone(),
            verbose: self.verbose,
        }
    }
}

fn development_defaults() -> NeubotResult<Defaults> {
    let workdir = std::env::current_dir()?;
    let user = match std::env::var("USER") {
        Ok(user) => user,
        Err(_) => nix::unistd::User::from_uid(nix::unistd::getuid())
            .map_err(std::io::Error::from)?
            .map(|u| u.name)
            .ok_or_else(|| NeubotError::Usage("cannot tell who is running".into()))?,
    };
    Ok(Defaults::development(&workdir, user))
}

fn plugin_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn run(cli: Cli) -> NeubotResult<()> {
    let logs = logging::init(cli.verbose)?;
    let platform = SystemPlatform::new(logs);

    let (unconfigured, defaults) = if cli.development {
        (Unconfigured::unchecked(platform), development_defaults()?)
    } else {
        (verify_privileged(platform)?, Defaults::production())
    };
    let configured = unconfigured.resolve_configuration(&cli.options(), &defaults)?;

    let config = configured.config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %config.address,
        ports = ?config.ports,
        "configuration resolved"
    );
    for (name, value) in config.settings() {
        debug!(setting = name, %value, "configured");
    }
    let backend = backend::setup(config.backend, &config.unpriv_user, &config.datadir())?;

    configured
        .bind_endpoints()?
        .register_handlers(backend)
        .load_plugins(&BuiltinPlugins::standard(), &plugin_root())
        .daemonize_if_requested()?
        .install_signal_handler()?
        .drop_privileges()?
        .run()
        .cleanup();
    Ok(())
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(_) => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        match e {
            NeubotError::Usage(reason) => {
                error!(%reason, "invalid usage");
                eprintln!("{USAGE}");
            }
            NeubotError::NotPrivileged => eprintln!("FATAL: you must be root"),
            other => {
                error!(error = %other, "fatal");
                eprintln!("FATAL: {other}");
            }
        }
        std::process::exit(1);
    }
}
