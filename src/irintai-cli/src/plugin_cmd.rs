//! Plugin management commands.
//!
//! - List discovered plugins and their status
//! - Show one plugin
//! - Read, change, reset and migrate plugin configuration
//! - Print configuration schemas
//! - Enable/disable plugins at startup
//! - Uninstall plugins

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;

use irintai_plugins::config::AUTOLOAD_KEY;
use irintai_plugins::{ConfigMap, ConfigStore, PluginManager, PluginStatus};

use crate::cli::HomeArgs;

/// Plugin CLI command.
#[derive(Debug, Parser)]
pub struct PluginCli {
    #[command(subcommand)]
    pub subcommand: PluginSubcommand,
}

/// Plugin subcommands.
#[derive(Debug, clap::Subcommand)]
pub enum PluginSubcommand {
    /// List discovered plugins
    #[command(visible_alias = "ls")]
    List(PluginListArgs),

    /// Show plugin information
    #[command(visible_alias = "info")]
    Show(PluginShowArgs),

    /// Read or change plugin configuration
    #[command(subcommand)]
    Config(ConfigSubcommand),

    /// Print a plugin's configuration schema
    Schema(PluginShowArgs),

    /// Load and activate a plugin at startup
    Enable(PluginNameArgs),

    /// Stop loading a plugin at startup
    Disable(PluginNameArgs),

    /// Remove a plugin's configuration and forget it
    #[command(visible_alias = "rm")]
    Uninstall(PluginUninstallArgs),
}

/// Configuration subcommands.
#[derive(Debug, clap::Subcommand)]
pub enum ConfigSubcommand {
    /// Print the resolved configuration
    Get(ConfigGetArgs),

    /// Set one or more values (`key=value`, values parsed as JSON when possible)
    Set(ConfigSetArgs),

    /// Restore default values
    Reset(PluginNameArgs),

    /// Fold legacy per-key settings into the plugin's section
    Migrate(PluginNameArgs),
}

/// Arguments for plugin list command.
#[derive(Debug, Parser)]
pub struct PluginListArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show only plugins enabled at startup
    #[arg(long)]
    pub enabled: bool,
}

/// Arguments for commands taking a plugin and an output format.
#[derive(Debug, Parser)]
pub struct PluginShowArgs {
    /// Plugin identifier
    pub name: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct PluginNameArgs {
    /// Plugin identifier
    pub name: String,
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    /// Plugin identifier
    pub name: String,

    /// Print only this key
    pub key: Option<String>,
}

#[derive(Debug, Parser)]
pub struct ConfigSetArgs {
    /// Plugin identifier
    pub name: String,

    /// Values as `key=value`
    #[arg(required = true, value_parser = parse_assignment)]
    pub values: Vec<(String, Value)>,

    /// Replace the whole configuration instead of merging
    #[arg(long)]
    pub replace: bool,
}

/// Arguments for plugin uninstall command.
#[derive(Debug, Parser)]
pub struct PluginUninstallArgs {
    /// Plugin identifier
    pub name: String,

    /// Skip confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,
}

/// Row printed by `plugin list`.
#[derive(Debug, Serialize)]
struct PluginRow {
    id: String,
    name: String,
    version: String,
    status: PluginStatus,
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

impl PluginCli {
    /// Run the plugin command.
    pub async fn run(self, home: &HomeArgs) -> Result<()> {
        let manager = home.manager().await?;
        match self.subcommand {
            PluginSubcommand::List(args) => run_list(&manager, args),
            PluginSubcommand::Show(args) => run_show(&manager, args),
            PluginSubcommand::Config(cmd) => run_config(&manager, cmd).await,
            PluginSubcommand::Schema(args) => run_schema(&manager, args),
            PluginSubcommand::Enable(args) => set_enabled(&manager, &args.name, true),
            PluginSubcommand::Disable(args) => set_enabled(&manager, &args.name, false),
            PluginSubcommand::Uninstall(args) => run_uninstall(&manager, args).await,
        }
    }
}

/// Parse `key=value`. The value is JSON when it parses, a string otherwise.
fn parse_assignment(raw: &str) -> std::result::Result<(String, Value), String> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(format!("expected key=value, got '{raw}'"));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn ensure_known(manager: &PluginManager, name: &str) -> Result<()> {
    if manager.descriptor(name).is_none() {
        bail!(
            "Plugin '{}' is not installed in {}.",
            name,
            manager.host().paths().plugin_dir.display()
        );
    }
    Ok(())
}

fn enabled_plugins(manager: &PluginManager) -> Vec<String> {
    match manager.host().config().get(AUTOLOAD_KEY) {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

fn run_list(manager: &PluginManager, args: PluginListArgs) -> Result<()> {
    let enabled = enabled_plugins(manager);
    let rows: Vec<PluginRow> = manager
        .plugin_info()
        .into_iter()
        .map(|info| PluginRow {
            enabled: enabled.contains(&info.id),
            id: info.id,
            name: info.name,
            version: info.version,
            status: info.status,
            last_error: info.last_error,
        })
        .filter(|row| !args.enabled || row.enabled)
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No plugins found.");
        println!(
            "\nPlugins are discovered in: {}",
            manager.host().paths().plugin_dir.display()
        );
        return Ok(());
    }

    println!(
        "{:<24} {:<12} {:<12} {:<8}",
        "ID", "VERSION", "STATUS", "STARTUP"
    );
    println!("{}", "-".repeat(60));
    for row in &rows {
        let version = if row.version.is_empty() {
            "-"
        } else {
            &row.version
        };
        let startup = if row.enabled { "yes" } else { "no" };
        println!(
            "{:<24} {:<12} {:<12} {:<8}",
            row.id,
            version,
            row.status.to_string(),
            startup
        );
    }
    Ok(())
}

fn run_show(manager: &PluginManager, args: PluginShowArgs) -> Result<()> {
    let Some(descriptor) = manager.descriptor(&args.name) else {
        bail!("Plugin '{}' is not installed.", args.name);
    };
    let info = descriptor.info();
    let config = manager.get_config(&args.name);

    if args.json {
        let output = serde_json::json!({
            "plugin": info,
            "path": descriptor.path,
            "config": config,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Plugin: {}", info.name);
    println!("{}", "-".repeat(40));
    println!("  ID:       {}", info.id);
    println!("  Status:   {}", info.status);
    println!("  Path:     {}", descriptor.path.display());
    if !info.version.is_empty() {
        println!("  Version:  {}", info.version);
    }
    if !info.author.is_empty() {
        println!("  Author:   {}", info.author);
    }
    if !info.description.is_empty() {
        println!("  About:    {}", info.description);
    }
    if let Some(error) = &info.last_error {
        println!("  Error:    {}", error);
    }
    if !config.is_empty() {
        println!("  Config:");
        for (key, value) in &config {
            println!("    {} = {}", key, value);
        }
    }
    Ok(())
}

async fn run_config(manager: &PluginManager, cmd: ConfigSubcommand) -> Result<()> {
    match cmd {
        ConfigSubcommand::Get(args) => {
            ensure_known(manager, &args.name)?;
            let config = manager.get_config(&args.name);
            match args.key {
                Some(key) => match config.get(&key) {
                    Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
                    None => bail!("Plugin '{}' has no setting '{}'.", args.name, key),
                },
                None => println!("{}", serde_json::to_string_pretty(&config)?),
            }
            Ok(())
        }
        ConfigSubcommand::Set(args) => {
            ensure_known(manager, &args.name)?;
            let mut config = if args.replace {
                ConfigMap::new()
            } else {
                manager.get_config(&args.name)
            };
            for (key, value) in args.values {
                config.insert(key, value);
            }
            manager
                .set_config(&args.name, config)
                .await
                .with_context(|| format!("Failed to save configuration of '{}'", args.name))?;
            println!("Configuration of '{}' updated.", args.name);
            Ok(())
        }
        ConfigSubcommand::Reset(args) => {
            ensure_known(manager, &args.name)?;
            let defaults = manager.reset_config(&args.name).await?;
            println!(
                "Configuration of '{}' reset to {} default value(s).",
                args.name,
                defaults.len()
            );
            Ok(())
        }
        ConfigSubcommand::Migrate(args) => {
            ensure_known(manager, &args.name)?;
            let moved = manager.migrate_legacy_config(&args.name)?;
            if moved == 0 {
                println!("No legacy settings to migrate for '{}'.", args.name);
            } else {
                println!("Migrated {} legacy setting(s) of '{}'.", moved, args.name);
            }
            Ok(())
        }
    }
}

fn run_schema(manager: &PluginManager, args: PluginShowArgs) -> Result<()> {
    ensure_known(manager, &args.name)?;
    let Some(schema) = manager.get_config_schema(&args.name) else {
        println!("Plugin '{}' has no configuration schema.", args.name);
        return Ok(());
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    for (key, field) in schema.iter() {
        let kind = serde_json::to_value(field.field_type)?;
        let kind = kind.as_str().unwrap_or("string");
        let label = if field.label.is_empty() {
            key.as_str()
        } else {
            field.label.as_str()
        };
        match &field.default {
            Some(default) => println!("{:<20} {:<8} {} (default {})", key, kind, label, default),
            None => println!("{:<20} {:<8} {}", key, kind, label),
        }
    }
    Ok(())
}

fn set_enabled(manager: &PluginManager, name: &str, enabled: bool) -> Result<()> {
    ensure_known(manager, name)?;
    let mut ids = enabled_plugins(manager);
    let present = ids.iter().any(|id| id == name);

    match (enabled, present) {
        (true, true) => {
            println!("Plugin '{}' is already enabled.", name);
            return Ok(());
        }
        (false, false) => {
            println!("Plugin '{}' is already disabled.", name);
            return Ok(());
        }
        (true, false) => ids.push(name.to_string()),
        (false, true) => ids.retain(|id| id != name),
    }

    let store = manager.host().config();
    store.set(AUTOLOAD_KEY, Value::from(ids));
    store.save().context("Failed to save host configuration")?;

    let verb = if enabled { "enabled" } else { "disabled" };
    println!("Plugin '{}' {}.", name, verb);
    Ok(())
}

async fn run_uninstall(manager: &PluginManager, args: PluginUninstallArgs) -> Result<()> {
    ensure_known(manager, &args.name)?;

    if !args.yes {
        println!(
            "Are you sure you want to uninstall plugin '{}'? (y/N)",
            args.name
        );
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    if enabled_plugins(manager).contains(&args.name) {
        set_enabled(manager, &args.name, false)?;
    }
    manager.uninstall(&args.name).await?;
    println!("Plugin '{}' uninstalled.", args.name);
    Ok(())
}
