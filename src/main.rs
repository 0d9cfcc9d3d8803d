//! ferry - Cancellable copy, move and delete with conflict and error policies.
//!
//! Usage:
//!   ferry copy SRC... DEST       Copy items (into DEST if it is a directory)
//!   ferry move SRC... DEST       Move items
//!   ferry delete PATH...         Delete items
//!   ferry plan OP PATH...        Show the task list without running it
//!   ferry --help                 Show help

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail};
use tracing_subscriber::EnvFilter;

use ferry_core::{
    ConflictContext, ConflictResolution, Destinations, ErrorContext, ErrorDecision,
    OperationConfig, OperationOptions, OperationRequest, OperationStatus, Stage,
};
use ferry_ops::{FileOperation, FixedPolicy, OperationDelegate, OperationReport, Plan};

#[derive(Parser)]
#[command(
    name = "ferry",
    version,
    about = "Copy, move and delete files with progress and conflict handling"
)]
struct Cli {
    /// Minimum milliseconds between progress updates
    #[arg(long, global = true, default_value = "250")]
    interval: u64,

    /// Number of top-level items processed at the same time
    #[arg(short, long, global = true, default_value = "1")]
    jobs: usize,

    /// Print the final report (or plan) as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy items to a destination
    Copy {
        /// Sources followed by the destination
        #[arg(required = true, num_args = 2..)]
        paths: Vec<PathBuf>,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Move items to a destination
    Move {
        /// Sources followed by the destination
        #[arg(required = true, num_args = 2..)]
        paths: Vec<PathBuf>,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Delete items
    Delete {
        /// Items to delete
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Show the tasks an operation would run
    Plan {
        /// Operation to plan
        operation: OperationArg,

        /// Sources, followed by the destination for copy and move
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[command(flatten)]
        policy: PolicyArgs,
    },
}

#[derive(Args, Clone)]
struct PolicyArgs {
    /// Replace existing items without asking
    #[arg(long)]
    overwrite: bool,

    /// Skip items that cannot be read, written or deleted
    #[arg(long)]
    skip_permission_errors: bool,

    /// Copy then delete instead of moving across volumes
    #[arg(long)]
    no_cross_volume: bool,

    /// What to do when the destination already exists
    #[arg(long, default_value = "quit")]
    on_conflict: ConflictArg,

    /// What to do when an item fails
    #[arg(long, default_value = "abort")]
    on_error: ErrorArg,
}

impl PolicyArgs {
    fn options(&self) -> OperationOptions {
        OperationOptions::default()
            .with_overwrite(self.overwrite)
            .with_skip_permission_errors(self.skip_permission_errors)
            .with_do_not_cross_volumes(self.no_cross_volume)
    }

    fn policy(&self) -> FixedPolicy {
        FixedPolicy::new(self.on_conflict.into(), self.on_error.into())
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OperationArg {
    Copy,
    Move,
    Delete,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConflictArg {
    Quit,
    Skip,
    Replace,
    KeepBoth,
    Merge,
}

impl From<ConflictArg> for ConflictResolution {
    fn from(arg: ConflictArg) -> Self {
        match arg {
            ConflictArg::Quit => Self::Quit,
            ConflictArg::Skip => Self::Skip,
            ConflictArg::Replace => Self::Replace,
            ConflictArg::KeepBoth => Self::KeepBoth,
            ConflictArg::Merge => Self::Merge,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ErrorArg {
    Abort,
    Skip,
}

impl From<ErrorArg> for ErrorDecision {
    fn from(arg: ErrorArg) -> Self {
        match arg {
            ErrorArg::Abort => Self::Abort,
            ErrorArg::Skip => Self::Skip,
        }
    }
}

/// Applies the command-line policy and draws a progress line on stderr.
struct TerminalDelegate {
    policy: FixedPolicy,
    show_progress: bool,
    last_stage: Mutex<Stage>,
}

impl TerminalDelegate {
    fn new(policy: FixedPolicy, show_progress: bool) -> Self {
        Self {
            policy,
            show_progress,
            last_stage: Mutex::new(Stage::Undefined),
        }
    }
}

impl OperationDelegate for TerminalDelegate {
    fn resolve_conflict(&self, context: &mut ConflictContext) -> ConflictResolution {
        let resolution = self.policy.resolve_conflict(context);
        tracing::info!(
            destination = %context.destination.display(),
            %resolution,
            "Destination exists"
        );
        resolution
    }

    fn resolve_error(&self, context: &ErrorContext) -> ErrorDecision {
        let decision = self.policy.resolve_error(context);
        tracing::warn!(
            path = %context.source.display(),
            reason = %context.reason,
            message = %context.message,
            %decision,
            "Item failed"
        );
        decision
    }

    fn should_proceed_on_progress(&self, status: &OperationStatus) -> bool {
        if !self.show_progress {
            return true;
        }

        let mut stderr = std::io::stderr().lock();
        let mut last = self
            .last_stage
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match status.stage {
            Stage::Preflighting if *last != Stage::Preflighting => {
                let _ = writeln!(stderr, "Preparing {}...", status.operation);
            }
            Stage::Running => {
                let _ = write!(
                    stderr,
                    "\r{:>5.1}%  {}/{} items  {} of {}  {}/s   ",
                    status.percentage(),
                    status.completed_objects,
                    status.total_objects,
                    format_size(status.completed_bytes),
                    format_size(status.total_bytes),
                    format_size(status.throughput as u64),
                );
            }
            Stage::Complete if *last == Stage::Running => {
                let _ = writeln!(stderr);
            }
            _ => {}
        }
        let _ = stderr.flush();
        *last = status.stage;
        true
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = OperationConfig::builder()
        .status_change_interval(Duration::from_millis(cli.interval))
        .max_concurrent_roots(cli.jobs)
        .build()
        .context("Invalid settings")?;

    match cli.command {
        Command::Copy { paths, policy } => {
            let (sources, destinations) = split_destination(paths)?;
            let files = engine(config, &policy, !cli.json);
            let report = files.copy_sync(sources, destinations, policy.options())?;
            print_report(&report, cli.json)?;
        }
        Command::Move { paths, policy } => {
            let (sources, destinations) = split_destination(paths)?;
            let files = engine(config, &policy, !cli.json);
            let report = files.move_sync(sources, destinations, policy.options())?;
            print_report(&report, cli.json)?;
        }
        Command::Delete { paths, policy } => {
            let files = engine(config, &policy, !cli.json);
            let report = files.delete_sync(paths, policy.options())?;
            print_report(&report, cli.json)?;
        }
        Command::Plan {
            operation,
            paths,
            policy,
        } => {
            let request = match operation {
                OperationArg::Copy => {
                    let (sources, destinations) = split_destination(paths)?;
                    OperationRequest::copy(sources, destinations, policy.options())
                }
                OperationArg::Move => {
                    let (sources, destinations) = split_destination(paths)?;
                    OperationRequest::move_to(sources, destinations, policy.options())
                }
                OperationArg::Delete => OperationRequest::delete(paths, policy.options()),
            };
            let files = engine(config, &policy, false);
            let plan = files.plan(&request).context("Planning failed")?;
            print_plan(&plan, cli.json)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn engine(config: OperationConfig, policy: &PolicyArgs, show_progress: bool) -> FileOperation {
    FileOperation::with_config(config)
        .with_delegate(TerminalDelegate::new(policy.policy(), show_progress))
}

/// Treat the last path as the destination.
///
/// An existing directory receives the sources by name; otherwise a single
/// source is given that exact path.
fn split_destination(mut paths: Vec<PathBuf>) -> Result<(Vec<PathBuf>, Destinations)> {
    let Some(destination) = paths.pop() else {
        bail!("A destination is required");
    };
    if paths.is_empty() {
        bail!("At least one source is required");
    }

    if destination.is_dir() {
        return Ok((paths, Destinations::Into(destination)));
    }
    if paths.len() > 1 {
        bail!(
            "Destination {} must be an existing directory when given several sources",
            destination.display()
        );
    }
    Ok((paths, Destinations::single(destination)))
}

fn print_report(report: &OperationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{}", report.summary());
    if report.bytes_transferred > 0 {
        println!(" {} transferred", format_size(report.bytes_transferred));
    }
    for item in &report.skipped_items {
        println!(" skipped {}: {}", item.path.display(), item.reason);
    }
    Ok(())
}

fn print_plan(plan: &Plan, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(plan)?);
        return Ok(());
    }

    println!("{}", "─".repeat(60));
    println!(
        " {} of {} items, {}",
        plan.operation,
        plan.total_objects,
        format_size(plan.total_bytes)
    );
    println!("{}", "─".repeat(60));

    for root in &plan.roots {
        if root.crosses_volumes {
            println!(" {} (crosses volumes)", root.source.display());
        }
        for task in &root.tasks {
            let target = task
                .destination
                .as_deref()
                .map(|d| format!(" -> {}", d.display()))
                .unwrap_or_default();
            println!(
                " {:>4} {:<22} {}{}",
                task.id,
                format!("{:?}", task.action),
                task.source.display(),
                target
            );
        }
    }
    Ok(())
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}
