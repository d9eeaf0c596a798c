//! Command line front end for the reversion engine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Error};
use clap::{Parser, Subcommand};

use reversion::client::workdir::{self, WorkDirectory};
use reversion::client::WorkDirCache;
use reversion::datastore::{
    self, CleanupPolicy, ConnectionCache, RepositoryConfig, RvnError, TimeUnit, FORMAT_VERSION,
};
use reversion::tools::task::ForegroundTask;

#[derive(Parser)]
#[command(name = "reversion", about = "Track and restore file version history")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Print the repository format version and exit.
    #[arg(long)]
    version: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the repository backing a working directory.
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },
    /// Manage cleanup policies of the current working directory.
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// Manage snapshot tags (name, description, pin).
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },
    /// Take a snapshot of the given paths.
    Commit {
        /// Files or directories to commit; the whole tree when omitted.
        paths: Vec<PathBuf>,
        /// Commit files even when they are unmodified.
        #[arg(long, short)]
        force: bool,
        /// Optional snapshot name.
        #[arg(long, short)]
        name: Option<String>,
        /// Snapshot description.
        #[arg(long, short, default_value = "")]
        description: String,
        /// Protect the snapshot from cleanup policies.
        #[arg(long, short)]
        pin: bool,
    },
    /// Bring files back to an earlier revision (with a safety snapshot).
    Restore {
        /// Files or directories to restore; the whole tree when omitted.
        paths: Vec<PathBuf>,
        /// Revision to restore; the latest when omitted.
        #[arg(long, short)]
        revision: Option<i64>,
    },
    /// List files modified since the last snapshot.
    Status,
    /// Check the repository for corruption.
    Verify {
        /// Execute the offered repairs instead of only reporting them.
        #[arg(long)]
        repair: bool,
    },
}

#[derive(Subcommand)]
enum RepoAction {
    /// Start tracking `path` as a working directory.
    Create {
        path: PathBuf,
        /// Split files into fixed blocks of this many bytes.
        #[arg(long)]
        block_size: Option<u64>,
        /// Use content defined chunking with the given average bits
        /// (e.g. 22 for ~4 MiB chunks).
        #[arg(long, conflicts_with = "block_size")]
        average_bits: Option<u32>,
    },
    /// Delete the version history of `path` (user files are kept).
    Delete { path: PathBuf },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Add a cleanup policy.
    Create {
        #[command(subcommand)]
        kind: PolicyKind,
    },
    /// Show the configured cleanup policies.
    List,
    /// Remove all cleanup policies.
    Clear,
}

#[derive(Subcommand)]
enum PolicyKind {
    /// Keep all versions forever.
    Forever,
    /// Keep the newest N versions of each file.
    Versions { count: u32 },
    /// Keep each version for a fixed length of time.
    Duration { amount: u32, unit: String },
    /// Keep N versions per interval, forever.
    Staggered { count: u32, unit: String },
}

#[derive(Subcommand)]
enum TagAction {
    /// Name a snapshot.
    Create { revision: i64, name: String },
    /// Remove a snapshot's name, description and pin.
    Remove { revision: i64 },
    /// Change name, description, or pin state of a snapshot.
    Modify {
        revision: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, conflicts_with = "no_pin")]
        pin: bool,
        #[arg(long)]
        no_pin: bool,
    },
    /// List snapshots and their tags.
    List,
    /// Show details of one snapshot.
    Info { revision: i64 },
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    if cli.version {
        println!("{}", FORMAT_VERSION);
        return ExitCode::SUCCESS;
    }

    let command = match cli.command {
        Some(command) => command,
        None => {
            eprintln!("no command given (try --help)");
            return ExitCode::from(1);
        }
    };

    match run(command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Exit codes: 1 for user errors, 2 for I/O and repository failures.
fn exit_code(err: &Error) -> u8 {
    match err.downcast_ref::<RvnError>() {
        Some(
            RvnError::InvalidInput(_)
            | RvnError::NotAWorkDirectory(_)
            | RvnError::DuplicateRecord(_),
        ) => 1,
        _ => 2,
    }
}

fn open_current_workdir(
    workdirs: &WorkDirCache,
    connections: &ConnectionCache,
) -> Result<Arc<WorkDirectory>, Error> {
    let cwd = std::env::current_dir()?;
    workdirs.open_from_descendant(&cwd, connections)
}

fn parse_unit(unit: &str) -> Result<TimeUnit, Error> {
    Ok(match unit.to_ascii_lowercase().as_str() {
        "second" | "seconds" => TimeUnit::Seconds,
        "minute" | "minutes" => TimeUnit::Minutes,
        "hour" | "hours" => TimeUnit::Hours,
        "day" | "days" => TimeUnit::Days,
        "week" | "weeks" => TimeUnit::Weeks,
        "month" | "months" => TimeUnit::Months,
        "year" | "years" => TimeUnit::Years,
        other => bail!(RvnError::InvalidInput(format!(
            "unknown time unit '{}'",
            other
        ))),
    })
}

fn run(command: Command) -> Result<(), Error> {
    let connections = datastore::default_cache();
    let workdirs = workdir::default_cache();

    match command {
        Command::Repo { action } => match action {
            RepoAction::Create {
                path,
                block_size,
                average_bits,
            } => {
                let mut config = RepositoryConfig::default();
                if let Some(block_size) = block_size {
                    config.block_size = block_size;
                }
                if let Some(average_bits) = average_bits {
                    config.chunker =
                        datastore::ChunkerSelector::ContentDefined { average_bits };
                }
                let workdir = workdirs.init(&path, config, connections)?;
                println!(
                    "tracking '{}' on timeline {}",
                    workdir.root().display(),
                    workdir.timeline()?.id()
                );
            }
            RepoAction::Delete { path } => {
                workdirs.delete(&path, connections)?;
                println!("deleted version history of '{}'", path.display());
            }
        },

        Command::Policy { action } => {
            let workdir = open_current_workdir(workdirs, connections)?;
            let timeline = workdir.timeline()?;
            match action {
                PolicyAction::Create { kind } => {
                    let policy = match kind {
                        PolicyKind::Forever => CleanupPolicy::forever(),
                        PolicyKind::Versions { count } => CleanupPolicy::of_versions(count),
                        PolicyKind::Duration { amount, unit } => {
                            CleanupPolicy::of_duration(amount, parse_unit(&unit)?)
                        }
                        PolicyKind::Staggered { count, unit } => {
                            CleanupPolicy::of_staggered(count, parse_unit(&unit)?)
                        }
                    };
                    println!("{}", policy.description());
                    let mut policies = timeline.cleanup_policies()?;
                    if !policies.contains(&policy) {
                        policies.push(policy);
                        timeline.set_cleanup_policies(&policies)?;
                    }
                }
                PolicyAction::List => {
                    for policy in timeline.cleanup_policies()? {
                        println!("{}", policy.description());
                    }
                }
                PolicyAction::Clear => {
                    timeline.set_cleanup_policies(&[])?;
                }
            }
        }

        Command::Tag { action } => {
            let workdir = open_current_workdir(workdirs, connections)?;
            let timeline = workdir.timeline()?;

            let snapshot_at = |revision: i64| {
                timeline.snapshot(revision)?.ok_or_else(|| {
                    Error::from(RvnError::InvalidInput(format!(
                        "no snapshot with revision {}",
                        revision
                    )))
                })
            };

            match action {
                TagAction::Create { revision, name } => {
                    let mut snapshot = snapshot_at(revision)?;
                    snapshot.set_name(Some(name))?;
                }
                TagAction::Remove { revision } => {
                    let mut snapshot = snapshot_at(revision)?;
                    snapshot.set_name(None)?;
                    snapshot.set_description(String::new())?;
                    snapshot.set_pinned(false)?;
                }
                TagAction::Modify {
                    revision,
                    name,
                    description,
                    pin,
                    no_pin,
                } => {
                    let mut snapshot = snapshot_at(revision)?;
                    if let Some(name) = name {
                        snapshot.set_name(Some(name))?;
                    }
                    if let Some(description) = description {
                        snapshot.set_description(description)?;
                    }
                    if pin {
                        snapshot.set_pinned(true)?;
                    } else if no_pin {
                        snapshot.set_pinned(false)?;
                    }
                }
                TagAction::List => {
                    for snapshot in timeline.snapshots()? {
                        println!(
                            "{:>6}  {}{}",
                            snapshot.revision(),
                            snapshot.name().unwrap_or("-"),
                            if snapshot.pinned() { "  [pinned]" } else { "" },
                        );
                    }
                }
                TagAction::Info { revision } => {
                    let snapshot = snapshot_at(revision)?;
                    println!("revision:    {}", snapshot.revision());
                    println!("name:        {}", snapshot.name().unwrap_or("-"));
                    println!("description: {}", snapshot.description());
                    println!("pinned:      {}", snapshot.pinned());
                    println!("files:       {}", snapshot.versions()?.len());
                }
            }
        }

        Command::Commit {
            paths,
            force,
            name,
            description,
            pin,
        } => {
            let workdir = open_current_workdir(workdirs, connections)?;
            match workdir.commit(&paths, force, name, &description, pin)? {
                Some(snapshot) => println!("created revision {}", snapshot.revision()),
                None => println!("nothing to commit"),
            }
        }

        Command::Restore { paths, revision } => {
            let workdir = open_current_workdir(workdirs, connections)?;
            let restored = workdir.restore(&paths, revision, &ForegroundTask)?;
            println!("restored {} file(s)", restored);
        }

        Command::Status => {
            let workdir = open_current_workdir(workdirs, connections)?;
            for path in workdir.status()? {
                println!("modified: {}", path);
            }
        }

        Command::Verify { repair } => {
            let workdir = open_current_workdir(workdirs, connections)?;
            let repo_path = workdir.repository().path().to_path_buf();

            let actions =
                datastore::verify::verify(&repo_path, connections, &ForegroundTask)?;
            if actions.is_empty() {
                println!("no problems found");
            }
            for action in actions {
                println!("{}", action.message());
                if !repair {
                    continue;
                }
                let report = action.repair(workdir.root(), connections, &ForegroundTask)?;
                if report.database_restored {
                    println!("database restored from backup");
                }
                for path in &report.repaired_versions {
                    println!("repaired: {}", path);
                }
                for path in &report.deleted_versions {
                    println!("deleted:  {}", path);
                }
            }
        }
    }

    Ok(())
}
