//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use mountguard::collector::filesystem::{FilesystemStats, FilesystemStatsCollector};
use mountguard::collector::filter::FilterVerdict;
use mountguard::collector::registry::StuckMountRegistry;
use mountguard::core::config::Config;
use mountguard::core::errors::MgError;
use mountguard::daemon::loop_main::{WatchArgs, WatchLoop};
use mountguard::exporter::scrape;
use mountguard::exporter::text::render_text;
use mountguard::platform::pal::detect_platform;

/// mountguard: filesystem statistics that keep flowing when mounts hang.
#[derive(Debug, Parser)]
#[command(
    name = "mountguard",
    author,
    version,
    about = "Timeout-resilient filesystem statistics collector",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run one collection and print the results.
    Scrape(ScrapeArgs),
    /// List enumerated mounts and whether the filters accept them.
    Mounts,
    /// Scrape on an interval, rewriting a textfile or printing to stdout.
    Watch(WatchCommandArgs),
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct ScrapeArgs {
    /// Print a human-readable table instead of the exposition format.
    /// Ignored with --json.
    #[arg(long)]
    table: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct WatchCommandArgs {
    /// Scrape interval in milliseconds (overrides daemon.scrape_interval_ms).
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    interval_ms: Option<u64>,
    /// Textfile to rewrite after every scrape (overrides daemon.output_file).
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Stop after this many scrapes.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    count: Option<u64>,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

impl From<MgError> for CliError {
    fn from(value: MgError) -> Self {
        match value {
            MgError::InvalidConfig { .. }
            | MgError::MissingConfig { .. }
            | MgError::ConfigParse { .. } => Self::User(value.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Scrape(args) => run_scrape(cli, args),
        Command::Mounts => run_mounts(cli),
        Command::Watch(args) => run_watch(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ──────────────────── scrape ────────────────────

fn build_collector(config: &Config) -> Result<FilesystemStatsCollector, CliError> {
    let platform = detect_platform(&config.paths)?;
    Ok(FilesystemStatsCollector::new(
        platform,
        StuckMountRegistry::global(),
        &config.collector,
    )?)
}

fn run_scrape(cli: &Cli, args: &ScrapeArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let collector = build_collector(&config)?;

    if cli.json {
        let mut stats = collector.get_stats()?;
        stats.sort_by(|a, b| a.labels.mount_point.cmp(&b.labels.mount_point));
        let payload = json!({
            "command": "scrape",
            "mount_timeout_ms": config.collector.mount_timeout_ms,
            "workers": collector.workers(),
            "records": serde_json::to_value(&stats)?,
            "stuck": serde_json::to_value(collector.registry().stuck_mounts())?,
        });
        return write_json_line(&payload);
    }

    if args.table {
        let mut stats = collector.get_stats()?;
        stats.sort_by(|a, b| a.labels.mount_point.cmp(&b.labels.mount_point));
        print_stats_table(&stats, cli.verbose);
        return Ok(());
    }

    let text = render_text(&scrape(&collector)?)?;
    let mut stdout = io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

fn print_stats_table(stats: &[FilesystemStats], verbose: bool) {
    println!(
        "{:<28} {:<20} {:<10} {:>10} {:>10} {:>6}  {}",
        "MOUNTPOINT", "DEVICE", "FSTYPE", "SIZE", "AVAIL", "USE%", "STATUS"
    );
    for record in stats {
        let mount = record.mount_point().to_string_lossy();
        let status = if let Some(cause) = &record.cause {
            if verbose {
                format!("error ({cause})").red().to_string()
            } else {
                "error".red().to_string()
            }
        } else if record.ro > 0.0 {
            "ro".yellow().to_string()
        } else {
            "ok".green().to_string()
        };

        if record.is_device_error() {
            println!(
                "{mount:<28} {:<20} {:<10} {:>10} {:>10} {:>6}  {status}",
                record.labels.device, record.labels.fs_type, "-", "-", "-",
            );
        } else {
            println!(
                "{mount:<28} {:<20} {:<10} {:>10} {:>10} {:>6}  {status}",
                record.labels.device,
                record.labels.fs_type,
                format_bytes(record.size),
                format_bytes(record.avail),
                format_use_pct(record),
            );
        }
    }
}

fn format_use_pct(record: &FilesystemStats) -> String {
    if record.size <= 0.0 {
        return "-".to_string();
    }
    let used = record.size - record.free;
    format!("{:.0}%", used / record.size * 100.0)
}

fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

// ──────────────────── mounts ────────────────────

fn run_mounts(cli: &Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let collector = build_collector(&config)?;
    let mounts = collector.mounts_with_verdicts()?;
    let registry = collector.registry();

    match output_mode(cli) {
        OutputMode::Human => {
            println!(
                "{:<28} {:<20} {:<12} {:<9} {}",
                "MOUNTPOINT", "DEVICE", "FSTYPE", "DEV", "VERDICT"
            );
            for (mount, verdict) in &mounts {
                if cli.quiet && *verdict != FilterVerdict::Accepted {
                    continue;
                }
                let verdict_str = match verdict {
                    FilterVerdict::Accepted if registry.is_stuck(&mount.mount_point) => {
                        "stuck".red().to_string()
                    }
                    FilterVerdict::Accepted => "accepted".green().to_string(),
                    other => format!("ignored ({})", other.as_str()).dimmed().to_string(),
                };
                println!(
                    "{:<28} {:<20} {:<12} {:<9} {verdict_str}",
                    mount.mount_point.to_string_lossy(),
                    mount.device,
                    mount.fs_type,
                    format!("{}:{}", mount.major, mount.minor),
                );
                if cli.verbose {
                    println!(
                        "    options: {} | {}",
                        mount.mount_options, mount.super_options
                    );
                }
            }
        }
        OutputMode::Json => {
            let entries: Vec<Value> = mounts
                .iter()
                .map(|(mount, verdict)| {
                    json!({
                        "mount_point": mount.mount_point.to_string_lossy(),
                        "device": mount.device,
                        "fs_type": mount.fs_type,
                        "major": mount.major,
                        "minor": mount.minor,
                        "read_only": mount.is_read_only(),
                        "verdict": verdict.as_str(),
                        "stuck": registry.is_stuck(&mount.mount_point),
                    })
                })
                .collect();
            let payload = json!({
                "command": "mounts",
                "mounts": entries,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ──────────────────── watch ────────────────────

fn run_watch(cli: &Cli, args: &WatchCommandArgs) -> Result<(), CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.verbose {
        config.logging.verbose = true;
    }

    let watch_args = WatchArgs {
        interval: args.interval_ms.map(Duration::from_millis),
        output: args.output.clone(),
        max_scrapes: args.count,
    };
    let mut watch = WatchLoop::init(config, watch_args)?;
    let scrapes = watch.run(&mut io::stdout().lock())?;

    if !cli.quiet {
        eprintln!("mountguard: {scrapes} scrapes completed");
    }
    Ok(())
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config
                    .stable_hash()
                    .map_err(|e| CliError::Runtime(e.to_string()))?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        if !cli.quiet {
                            println!("Configuration is valid.");
                            println!("  Source: {}", config.paths.config_file.display());
                            println!("  Hash: {hash}");
                        }
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                            "code": e.code(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── output helpers ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("MOUNTGUARD_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
