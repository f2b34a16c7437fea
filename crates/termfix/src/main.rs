//! termfix CLI
//!
//! Full-agent terminal monitoring: tail a capture file, detect faults in
//! the output, fix them automatically, and relaunch the failed command.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use termfix::client::{FixClient, FixServiceConfig};
use termfix::engine::{EngineConfig, RemediationEngine};
use termfix::launcher::ProcessLauncher;
use termfix::ledger::{FaultLedger, FixedFileRegistry};
use termfix::monitor::{scan_file, Monitor, MonitorConfig};
use termfix::tailer::TailConfig;

/// Terminal session monitor - detects failures in captured output and applies automatic fixes
#[derive(Parser)]
#[command(name = "termfix")]
#[command(about = "Terminal session monitor - detects failures in captured output and applies automatic fixes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// [PRIMARY] Monitor a capture file and remediate faults automatically
    Monitor {
        /// Capture file to tail (a temp path is generated when omitted)
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Base URL of the fix-analysis service
        #[arg(long, env = "TERMFIX_API_URL", default_value = "http://localhost:8000")]
        api_url: String,

        /// Bearer token for the fix-analysis service
        #[arg(long, env = "TERMFIX_API_TOKEN")]
        token: Option<String>,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "100")]
        poll_ms: u64,

        /// Seconds to wait for the capture file to appear
        #[arg(long, default_value = "30")]
        create_timeout: u64,

        /// Recency window in seconds for restarting the last command
        #[arg(long, default_value = "30")]
        restart_window: u64,

        /// Minimum accepted patch size in characters
        #[arg(long, default_value = "50")]
        min_patch_chars: usize,

        /// Installer used for missing dependencies
        #[arg(long, default_value = "pip")]
        installer: String,

        /// Timeout in seconds for file-patch analysis requests
        #[arg(long, default_value = "180")]
        patch_timeout: u64,

        /// Timeout in seconds for fix-command analysis requests
        #[arg(long, default_value = "120")]
        command_timeout: u64,

        /// Do not echo monitored lines
        #[arg(long)]
        no_echo: bool,
    },
    /// Scan an existing capture file and report faults without fixing
    Scan {
        /// Capture file to scan
        log_file: PathBuf,

        /// Trailing lines per classification window
        #[arg(long, default_value = "10")]
        fault_window: usize,

        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Monitor {
            log_file,
            api_url,
            token,
            poll_ms,
            create_timeout,
            restart_window,
            min_patch_chars,
            installer,
            patch_timeout,
            command_timeout,
            no_echo,
        } => {
            run_monitor(MonitorArgs {
                log_file,
                api_url,
                token,
                poll_ms,
                create_timeout,
                restart_window,
                min_patch_chars,
                installer,
                patch_timeout,
                command_timeout,
                no_echo,
            })
            .await
        }
        Commands::Scan {
            log_file,
            fault_window,
            json,
        } => run_scan(&log_file, fault_window, json),
    }
}

struct MonitorArgs {
    log_file: Option<PathBuf>,
    api_url: String,
    token: Option<String>,
    poll_ms: u64,
    create_timeout: u64,
    restart_window: u64,
    min_patch_chars: usize,
    installer: String,
    patch_timeout: u64,
    command_timeout: u64,
    no_echo: bool,
}

async fn run_monitor(args: MonitorArgs) -> Result<()> {
    let log_file = match args.log_file {
        Some(path) => path,
        None => temp_log_path()?,
    };

    println!();
    println!("{}", "Full-Agent Mode".white().bold());
    println!();

    if !log_file.exists() {
        print_capture_instructions(&log_file);
    }

    let client = FixClient::new(FixServiceConfig {
        base_url: args.api_url,
        token: args.token,
        patch_timeout: Duration::from_secs(args.patch_timeout),
        command_timeout: Duration::from_secs(args.command_timeout),
    });

    let registry = Arc::new(FixedFileRegistry::default());
    let ledger = FaultLedger::new(Arc::clone(&registry));
    let engine = Arc::new(RemediationEngine::new(
        EngineConfig {
            restart_window: Duration::from_secs(args.restart_window),
            min_patch_chars: args.min_patch_chars,
            installer: args.installer,
        },
        client,
        registry,
        Box::new(ProcessLauncher),
    ));

    let mut config = MonitorConfig::new(log_file.clone());
    config.tail = TailConfig {
        poll_interval: Duration::from_millis(args.poll_ms),
        create_timeout: Duration::from_secs(args.create_timeout),
    };
    config.echo_lines = !args.no_echo;

    let mut monitor = Monitor::new(config, ledger, engine);
    let stats = monitor.run().await?;

    println!();
    println!("{}", "Full-Agent Mode stopped".white().bold());
    println!(
        "Faults detected: {}  Fixes applied: {}  Restarts: {}",
        stats.faults_detected.to_string().white(),
        stats.fixes_applied.to_string().white(),
        stats.restarts.to_string().white(),
    );
    println!("{}", format!("Log file: {}", log_file.display()).dimmed());
    Ok(())
}

fn run_scan(log_file: &std::path::Path, fault_window: usize, json: bool) -> Result<()> {
    let report = scan_file(log_file, fault_window)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    info!(lines = report.lines_scanned, "Scan complete");
    if report.faults.is_empty() {
        println!("No faults found in {}", log_file.display());
        return Ok(());
    }

    println!(
        "{} fault(s) in {} ({} lines):",
        report.faults.len(),
        log_file.display(),
        report.lines_scanned
    );
    for fault in &report.faults {
        let location = match (&fault.file_path, fault.line_number) {
            (Some(path), Some(line)) => format!(" [{}:{line}]", path.display()),
            (Some(path), None) => format!(" [{}]", path.display()),
            _ => fault
                .module
                .as_ref()
                .map(|m| format!(" [{m}]"))
                .unwrap_or_default(),
        };
        println!(
            "  {}{} - {}",
            fault.kind.label().yellow(),
            location,
            fault.matched_text.lines().next().unwrap_or("")
        );
    }
    Ok(())
}

/// Generate a persistent temp path for the capture log, ready to hand to
/// `script` or a `Tee-Object` pipeline.
fn temp_log_path() -> Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("termfix_agent_")
        .suffix(".log")
        .tempfile()?;
    // Keep the file on disk: the external capture process writes to it
    let (_, path) = file.keep()?;
    Ok(path)
}

/// Tell the operator how to pipe their terminal into the capture file.
fn print_capture_instructions(log_file: &std::path::Path) {
    println!("Run this command in the terminal you want monitored:");
    println!();
    if cfg!(windows) {
        println!(
            "  {}",
            format!(
                "YourCommand 2>&1 | Tee-Object -FilePath '{}' -Append",
                log_file.display()
            )
            .white()
        );
    } else if cfg!(target_os = "macos") {
        println!("  {}", format!("script -q {}", log_file.display()).white());
    } else {
        println!("  {}", format!("script -q -f {}", log_file.display()).white());
    }
    println!();
    println!("{}", format!("Log file: {}", log_file.display()).dimmed());
    println!();
}
