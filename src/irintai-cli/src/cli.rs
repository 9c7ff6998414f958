//! Top-level arguments, logging setup and command dispatch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use irintai_plugins::host::{HOME_ENV, default_home};
use irintai_plugins::{HostContext, HostPaths, JsonConfigStore, PluginCatalog, PluginManager};

use crate::plugin_cmd::PluginCli;

/// Host configuration file, relative to the home directory.
pub const CONFIG_FILE: &str = "config.json";

/// Environment variable consulted for the log level.
pub const LOG_LEVEL_ENV: &str = "IRINTAI_LOG_LEVEL";

/// Irintai plugin tool.
#[derive(Debug, Parser)]
#[command(name = "irintai", version, about, propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub home: HomeArgs,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Shorthand for --log-level trace
    #[arg(long, global = true)]
    pub trace: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Inspect and manage installed plugins
    #[command(visible_alias = "plugins")]
    Plugin(PluginCli),

    /// Print the directories in use
    Paths(PathsArgs),
}

/// Directory overrides.
#[derive(Debug, Clone, Default, Args)]
pub struct HomeArgs {
    /// Irintai home directory
    #[arg(long, global = true, env = HOME_ENV)]
    pub home: Option<PathBuf>,

    /// Directory holding one subdirectory per plugin
    #[arg(long, global = true)]
    pub plugin_dir: Option<PathBuf>,

    /// Root of per-plugin configuration directories
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Root of per-plugin data directories
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Read-only resources shared with plugins
    #[arg(long, global = true)]
    pub shared_dir: Option<PathBuf>,
}

impl HomeArgs {
    pub fn home(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(default_home)
    }

    /// Standard layout under the home directory with overrides applied.
    pub fn paths(&self) -> HostPaths {
        let mut paths = HostPaths::under(self.home());
        if let Some(dir) = &self.plugin_dir {
            paths.plugin_dir = dir.clone();
        }
        if let Some(dir) = &self.config_dir {
            paths.config_dir = dir.clone();
        }
        if let Some(dir) = &self.data_dir {
            paths.data_dir = dir.clone();
        }
        if let Some(dir) = &self.shared_dir {
            paths.shared_dir = Some(dir.clone());
        }
        paths
    }

    /// Open the host configuration and build a manager with discovery run.
    ///
    /// The command-line tool ships no compiled-in plugins, so the catalog
    /// is empty and plugins can be inspected and configured but not loaded.
    pub async fn manager(&self) -> Result<PluginManager> {
        let home = self.home();
        check_home_writable(&home)?;

        let paths = self.paths();
        paths
            .ensure()
            .context("Failed to create plugin directories")?;

        let store = JsonConfigStore::open(home.join(CONFIG_FILE))
            .with_context(|| format!("Failed to open {}", home.join(CONFIG_FILE).display()))?;
        let host = HostContext::new(paths, Arc::new(store));
        let manager = PluginManager::new(Arc::new(host), Arc::new(PluginCatalog::new()));
        manager.discover().await;
        Ok(manager)
    }
}

#[derive(Debug, Args)]
pub struct PathsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    /// Only show errors
    Error,
    /// Show warnings and errors (default)
    #[default]
    Warn,
    /// Show informational messages and above
    Info,
    /// Show debug messages and above
    Debug,
    /// Show everything
    Trace,
}

impl LogLevel {
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Parse from string (case-insensitive).
    pub fn from_str_loose(s: &str) -> Option<LogLevel> {
        match s.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

impl Cli {
    /// Effective log level: flags first, then the environment.
    pub fn log_level(&self) -> LogLevel {
        if self.trace {
            LogLevel::Trace
        } else if self.verbose {
            LogLevel::Debug
        } else if let Some(level) = self.log_level {
            level
        } else {
            std::env::var(LOG_LEVEL_ENV)
                .ok()
                .and_then(|v| LogLevel::from_str_loose(&v))
                .unwrap_or_default()
        }
    }

    /// Install the global tracing subscriber.
    ///
    /// `RUST_LOG` wins over everything else when set.
    pub fn init_logging(&self) {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
            let level = self.log_level().as_filter_str();
            format!("irintai_plugins={level},irintai_cli={level}")
        });

        let builder = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
            .with_writer(std::io::stderr);
        if self.log_json {
            builder.json().init();
        } else {
            builder.with_target(false).init();
        }
    }

    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Plugin(plugin_cli) => plugin_cli.run(&self.home).await,
            Commands::Paths(args) => run_paths(&self.home, args),
        }
    }
}

fn run_paths(home: &HomeArgs, args: PathsArgs) -> Result<()> {
    let paths = home.paths();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&paths)?);
        return Ok(());
    }

    println!("Home:     {}", home.home().display());
    println!("Plugins:  {}", paths.plugin_dir.display());
    println!("Config:   {}", paths.config_dir.display());
    println!("Data:     {}", paths.data_dir.display());
    match &paths.shared_dir {
        Some(dir) => println!("Shared:   {}", dir.display()),
        None => println!("Shared:   (none)"),
    }
    Ok(())
}

/// Fail early with a readable message when the home cannot be written.
fn check_home_writable(home: &Path) -> Result<()> {
    if let Err(e) = std::fs::create_dir_all(home) {
        bail!(
            "Cannot create Irintai home at {}: {}\n\
             Set {} or pass --home to use another directory.",
            home.display(),
            e,
            HOME_ENV
        );
    }

    let probe = home.join(".write_test");
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            Ok(())
        }
        Err(e) => bail!(
            "Irintai home at {} is not writable: {}\n\
             Set {} or pass --home to use another directory.",
            home.display(),
            e,
            HOME_ENV
        ),
    }
}
