use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use habitsync::cli::args::Cli;
use habitsync::cli::commands;
use habitsync::config::Config;

const LOG_ENV: &str = "HABITSYNC_LOG";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}: {:#}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let paths = commands::resolve_paths(cli.home)?;
    let config = Config::load_from_path(&paths.config_file)?;
    init_logging(&config.general.log_level);

    let format = cli.output.unwrap_or(config.general.default_output);
    let engine = commands::open_engine(&config, &paths, cli.offline).await?;
    let output = commands::execute(&engine, cli.command, format).await?;

    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
