use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use quickdist_node::Node;
use quickdist_transport::ReplyServer;

/// Lightweight distributed job-execution fabric: an orchestrator fans calls
/// out across node process pools, staging files between origin, local-cache
/// and tempdir tiers around every call.
#[derive(Debug, Parser)]
#[command(
    name = "quickdist",
    version = include_str!(concat!(env!("OUT_DIR"), "/version.txt")),
    about
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs a node server, answering PING/INFO/SETUP/CALL/MOUNT requests.
    Serve {
        /// Address to bind, e.g. 0.0.0.0:8421.
        #[arg(long, default_value = "0.0.0.0:8421")]
        addr: String,
        /// Number of request-handling threads. Defaults to the number of
        /// CPUs.
        #[arg(long)]
        threads: Option<usize>,
        /// Number of threads dedicated to staging files between tiers.
        #[arg(long)]
        staging_threads: Option<usize>,
    },
    /// Updates `~/.quickdist/config.json`. `key` is one of `origin`,
    /// `local`, `temp`, or `origin.<tag>`; `path` must already exist on
    /// disk.
    Config { key: String, path: String },
}

fn main() -> ExitCode {
    env_logger::Builder::from_default_env().init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve {
            addr,
            threads,
            staging_threads,
        } => run_serve(&addr, threads, staging_threads),
        Command::Config { key, path } => run_config(&key, &path),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_serve(addr: &str, threads: Option<usize>, staging_threads: Option<usize>) -> anyhow::Result<()> {
    let threads = threads.unwrap_or_else(num_cpus::get);
    let staging_threads = staging_threads.unwrap_or_else(num_cpus::get);

    let node = Arc::new(Node::new(staging_threads));
    let handler_node = Arc::clone(&node);
    let _server = ReplyServer::bind(addr, threads, Arc::new(move |msg| handler_node.handle(msg)))?;
    log::info!("node listening on {addr} with {threads} request threads");

    ctrlc::set_handler(move || {
        log::info!("shutting down");
        std::process::exit(0);
    })?;

    // The reply server's threads run for the lifetime of the process; park
    // the main thread so `server` (and the threads it owns) stay alive.
    loop {
        std::thread::park();
    }
}

fn run_config(key: &str, path: &str) -> anyhow::Result<()> {
    use quickdist_files::{load_config, save_config};

    if !std::path::Path::new(path).exists() {
        anyhow::bail!("path {path} does not exist");
    }

    let mut config = load_config()?;
    config_set(&mut config, key, path.to_string())?;
    save_config(&config)?;
    Ok(())
}

fn config_set(config: &mut quickdist_files::Config, key: &str, value: String) -> anyhow::Result<()> {
    match key {
        "temp" => config.tempdir = Some(value),
        "local" => config.localdir = Some(value),
        "origin" => config.workdir = Some(value),
        key if key.starts_with("origin.") && key.len() > 7 => {
            config.workdirs.insert(key[7..].to_string(), value);
        }
        _ => anyhow::bail!("unknown config key {key}"),
    }
    Ok(())
}
