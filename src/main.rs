use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use guarded_exec::archive::unarchive_file;
use guarded_exec::config::Config;
use guarded_exec::{Fallback, GuardedExecutor, Outcome};

const DEFAULT_CONFIG_PATH: &str = "config/guarded-exec.toml";

fn print_help() {
    println!(
        "\
guarded-exec v{}

Decodes archive files under panic supervision. A corrupt archive is
reported and skipped instead of crashing the process.

USAGE:
    guarded-exec [OPTIONS] ARCHIVE...

ARGUMENTS:
    ARCHIVE    One or more archive files to decode

OPTIONS:
    -c, --config PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing, overrides [logging] filter
                (e.g. debug, guarded_exec=debug,warn)

EXAMPLES:
    guarded-exec notes.archive                      # uses {DEFAULT_CONFIG_PATH}
    guarded-exec -c /etc/guarded-exec.toml a b c    # custom config path
    RUST_LOG=debug guarded-exec notes.archive       # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Run(Args),
    Help,
    Version,
}

#[derive(Debug, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    archives: Vec<PathBuf>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command> {
    let mut config = None;
    let mut archives = Vec::new();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => return Ok(Command::Version),
            "--help" | "-h" => return Ok(Command::Help),
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow!("{arg} requires a path"))?;
                config = Some(PathBuf::from(path));
            }
            flag if flag.starts_with('-') => bail!("Unknown option: {flag}"),
            _ => archives.push(PathBuf::from(arg)),
        }
    }

    if archives.is_empty() {
        bail!("No archive given. Run with --help for usage.");
    }

    Ok(Command::Run(Args { config, archives }))
}

/// Loads the explicit config, or the default one if it exists.
fn load_config(explicit: Option<&Path>) -> Result<Config> {
    match explicit {
        Some(path) => Config::load(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH),
        None => Ok(Config::default()),
    }
}

/// Short description of a decoded root value for the log.
fn summarize(value: &Value) -> String {
    match value {
        Value::Object(map) => format!("object with {} keys", map.len()),
        Value::Array(items) => format!("array of {} items", items.len()),
        Value::String(_) => "string".to_string(),
        Value::Number(n) => format!("number {n}"),
        Value::Bool(b) => format!("bool {b}"),
        Value::Null => "null".to_string(),
    }
}

/// Builds the executor that decodes one archive.
fn archive_executor(
    path: PathBuf,
    config: &Config,
    failures: Arc<AtomicUsize>,
    done_tx: mpsc::UnboundedSender<PathBuf>,
) -> Result<GuardedExecutor> {
    let max_bytes = config.archive.max_bytes;
    let work_path = path.clone();
    let error_path = path.clone();

    let mut builder = GuardedExecutor::builder(move || {
        unarchive_file(&work_path, max_bytes).map(|root| {
            info!("Decoded {}: {}", work_path.display(), summarize(&root));
        })
    })
    .on_finally(move || {
        let _ = done_tx.send(path.clone());
    })
    .schedule(config.executor.schedule())
    .fallback(config.executor.fallback);

    // In log-only mode the default sink reports and the failure is ignored
    if config.executor.fallback == Fallback::Report {
        builder = builder.on_error(move |e| {
            warn!("Skipping {}: {e}", error_path.display());
            failures.fetch_add(1, Ordering::SeqCst);
        });
    }

    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match parse_args(std::env::args().skip(1))? {
        Command::Version => {
            println!("guarded-exec v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Run(args) => args,
    };

    let config = load_config(args.config.as_deref())?;

    // Initialize logging (RUST_LOG wins over the config filter)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .init();

    info!(
        "Decoding {} archive(s), schedule: {}, fallback: {:?}",
        args.archives.len(),
        config.executor.schedule_description(),
        config.executor.fallback
    );

    let failures = Arc::new(AtomicUsize::new(0));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<PathBuf>();

    let mut manual = Vec::new();
    for path in &args.archives {
        let executor = archive_executor(path.clone(), &config, failures.clone(), done_tx.clone())?;
        if !executor.schedule().runs_automatically() {
            manual.push(executor);
        }
    }
    drop(done_tx);

    for executor in &manual {
        match executor.run() {
            Outcome::Completed | Outcome::Handled | Outcome::Swallowed => {}
            Outcome::Unhandled(e) => warn!("Unhandled exception: {e}"),
        }
    }

    // Every executor signals once from its finalizer
    let mut remaining = args.archives.len();
    while remaining > 0 {
        tokio::select! {
            done = done_rx.recv() => match done {
                Some(path) => {
                    debug!("Finished {}", path.display());
                    remaining -= 1;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                return Ok(());
            }
        }
    }

    let failed = failures.load(Ordering::SeqCst);
    if failed > 0 {
        return Err(anyhow!(
            "{failed} of {} archive(s) could not be decoded",
            args.archives.len()
        ));
    }

    info!("All archives decoded");
    Ok(())
}
