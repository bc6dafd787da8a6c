use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::sync::{OperationStatus, OperationType, Priority, Resolution};
use crate::transport::HttpMethod;

#[derive(Parser)]
#[command(name = "habitsync")]
#[command(about = "Offline-first sync queue for habit, journal and check-in operations")]
#[command(long_about = "habitsync - offline-first sync engine

Queues habit, journal and check-in changes locally and submits them to the
server in priority order, with retries, error recovery and conflict handling.

QUICK START:
  habitsync add habit-toggle --endpoint /habits/h1/toggle --data '{\"completed\":true}'
  habitsync status          Show queue health
  habitsync run             Submit pending operations
  habitsync conflicts list  Show operations the server rejected as conflicting

OUTPUT FORMATS:
  --output pretty    Human-readable colored output (default)
  --output json      Machine-readable JSON for scripting

Data lives in ~/.habitsync/ unless --home or HABITSYNC_HOME says otherwise.")]
#[command(version, propagate_version = true)]
pub struct Cli {
    /// Output format for command results
    ///
    /// Defaults to the format configured in config.yaml, else 'pretty'.
    #[arg(short, long, value_enum, global = true)]
    pub output: Option<OutputFormat>,

    /// Data directory holding config.yaml and habitsync.db
    #[arg(long, env = "HABITSYNC_HOME", global = true)]
    pub home: Option<PathBuf>,

    /// Treat the network as unavailable; nothing is submitted
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for command results.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable colored output.
    #[default]
    Pretty,
    /// Machine-readable JSON output.
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show queue metrics and health
    ///
    /// Health is 'warning' when too many operations are pending or the
    /// oldest one is stale, and 'error' when too many have failed.
    #[command(alias = "st")]
    Status,

    /// List queued operations
    ///
    /// # Examples
    ///
    ///   habitsync list                    All operations
    ///   habitsync list --status failed    Only failed operations
    ///   habitsync list -o json            Output as JSON
    #[command(alias = "ls")]
    List {
        /// Filter by status (pending, syncing, failed, completed)
        #[arg(long, short = 's', value_parser = parse_status)]
        status: Option<OperationStatus>,
    },

    /// Queue an operation
    ///
    /// # Examples
    ///
    ///   habitsync add habit-toggle --endpoint /habits/h1/toggle \
    ///       --data '{"habitId":"h1","date":"2024-06-01","completed":true}'
    ///   habitsync add journal-delete --endpoint /journal/j9 --method delete
    ///   habitsync add habit-update --endpoint /habits/h1 --depends-on op_abc
    #[command(alias = "a")]
    Add(AddArgs),

    /// Submit pending operations, then pending offline requests
    Run,

    /// Reset failed operations that still have retries left
    Retry,

    /// Remove operations from the queue
    ///
    /// Removes completed operations by default.
    Clear {
        /// Remove every operation and conflict
        #[arg(long)]
        all: bool,

        /// Required with --all
        #[arg(long)]
        force: bool,
    },

    /// Inspect and resolve conflicts
    Conflicts(ConflictsArgs),

    /// List requests saved by error recovery for later delivery
    Requests,

    /// Print this device's identifier
    Device,
}

#[derive(Args)]
pub struct AddArgs {
    /// Operation type, e.g. habit-toggle, journal-create, checkin-create
    #[arg(value_parser = parse_operation_type)]
    pub operation_type: OperationType,

    /// Server endpoint, e.g. /habits/h1/toggle
    #[arg(long, short = 'e')]
    pub endpoint: String,

    /// HTTP method
    #[arg(long, short = 'm', default_value = "post", value_parser = parse_method)]
    pub method: HttpMethod,

    /// Payload as JSON
    #[arg(long, short = 'd')]
    pub data: Option<String>,

    /// Priority (low, normal, high, critical); defaults by type
    #[arg(long, short = 'p', value_parser = parse_priority)]
    pub priority: Option<Priority>,

    /// Operation that must complete first (repeatable)
    #[arg(long = "depends-on")]
    pub depends_on: Vec<String>,
}

#[derive(Args)]
pub struct ConflictsArgs {
    #[command(subcommand)]
    pub command: ConflictCommands,
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List open conflicts, oldest first
    List,

    /// Resolve one conflict
    ///
    /// 'server' drops the local change. 'client' re-sends the local data.
    /// 'merge' re-sends --data, or local fields layered over the server's.
    Resolve {
        /// Conflict id (the id of the conflicted operation)
        id: String,

        /// Which side wins
        #[arg(value_parser = parse_resolution)]
        resolution: Resolution,

        /// Merged data as JSON, for 'merge'
        #[arg(long, short = 'd')]
        data: Option<String>,
    },

    /// Resolve every open conflict in favour of the server
    Auto,
}

fn parse_status(s: &str) -> Result<OperationStatus, String> {
    match s.to_lowercase().as_str() {
        "pending" | "syncing" | "failed" | "completed" => Ok(OperationStatus::from_string(s)),
        _ => Err(format!(
            "invalid status '{s}' (expected pending, syncing, failed or completed)"
        )),
    }
}

fn parse_operation_type(s: &str) -> Result<OperationType, String> {
    OperationType::parse(&s.to_lowercase()).ok_or_else(|| {
        let known: Vec<_> = OperationType::ALL.iter().map(OperationType::as_str).collect();
        format!("unknown operation type '{s}' (expected one of: {})", known.join(", "))
    })
}

fn parse_priority(s: &str) -> Result<Priority, String> {
    Priority::parse(s).ok_or_else(|| format!("invalid priority '{s}'"))
}

fn parse_method(s: &str) -> Result<HttpMethod, String> {
    s.parse()
}

fn parse_resolution(s: &str) -> Result<Resolution, String> {
    s.parse()
}
