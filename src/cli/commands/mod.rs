//! Command implementations for habitsync.
//!
//! Every command renders its result as a `String` in the requested
//! [`OutputFormat`]; printing is left to the binary.

mod conflicts;
mod queue;

use std::path::PathBuf;
use std::sync::Arc;

pub use conflicts::conflicts;
pub use queue::{add, clear, device, list, requests, retry, run, status};

use crate::cli::args::{Commands, OutputFormat};
use crate::config::{Config, Paths};
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::recovery::UnavailableRefresher;
use crate::transport::HttpTransport;

/// Resolve the data directory from `--home`, `HABITSYNC_HOME` or the home
/// directory.
///
/// # Errors
///
/// Returns an error if no home directory can be determined.
pub fn resolve_paths(home: Option<PathBuf>) -> Result<Paths, SyncError> {
    home.map_or_else(Paths::new, |root| Ok(Paths::with_root(root)))
}

/// Open the engine the CLI works with.
///
/// Passes only run when a command asks for one, so background processing
/// after enqueueing is disabled.
///
/// # Errors
///
/// Returns an error if no database can be opened.
pub async fn open_engine(
    config: &Config,
    paths: &Paths,
    offline: bool,
) -> Result<SyncEngine, SyncError> {
    let mut config = config.clone();
    config.queue.auto_process = false;

    let transport = Arc::new(HttpTransport::with_timeout(
        &config.server.base_url,
        config.server.request_timeout(),
    ));
    transport
        .set_access_token(config.server.auth_token.clone())
        .await;

    let engine = SyncEngine::open(&config, paths, transport, Arc::new(UnavailableRefresher))?;
    if offline {
        engine.connectivity().set_online(false);
    }
    Ok(engine)
}

/// Dispatch a parsed command.
///
/// # Errors
///
/// Returns whatever error the command produced.
pub async fn execute(
    engine: &SyncEngine,
    command: Commands,
    format: OutputFormat,
) -> Result<String, SyncError> {
    match command {
        Commands::Status => status(engine, format),
        Commands::List { status } => list(engine, status, format),
        Commands::Add(args) => add(engine, args, format),
        Commands::Run => run(engine, format).await,
        Commands::Retry => retry(engine, format),
        Commands::Clear { all, force } => clear(engine, all, force, format),
        Commands::Conflicts(args) => conflicts(engine, args.command, format),
        Commands::Requests => requests(engine, format),
        Commands::Device => device(engine, format),
    }
}
