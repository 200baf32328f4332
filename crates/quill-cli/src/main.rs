//! Quill CLI
//!
//! Drive the transform engine from a terminal: one-shot transforms, an
//! interactive session, policy checks and DSL validation.

use anyhow::Context;
use clap::{Parser, Subcommand};
use quill_engine::{EngineConfig, LimitKey, TransformEngine, TransformError, TransformRequest};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "quill")]
#[command(author = "Quill Contributors")]
#[command(version)]
#[command(about = "Quill - safe natural-language site transforms", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true, env = "QUILL_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one request through the pipeline
    Transform {
        /// Request text, e.g. "把主标题改成：欢迎"
        text: String,

        /// Client IP
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,

        /// Client user agent
        #[arg(long, default_value = "quill-cli")]
        user_agent: String,
    },

    /// Interactive session; lines starting with ':' are commands
    Repl {
        /// Client IP
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,

        /// Client user agent
        #[arg(long, default_value = "quill-cli")]
        user_agent: String,
    },

    /// Run the text policy checks only
    Check {
        /// Text to screen
        text: String,
    },

    /// Validate a DSL document (schema and policy)
    Validate {
        /// JSON file; reads stdin when omitted
        file: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_logging(verbose: bool, json: bool) {
    let env_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => {
            let config = EngineConfig::load(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?;
            tracing::debug!("Configuration loaded from {}", path.display());
            Ok(config)
        }
        None => {
            tracing::debug!("Using default configuration");
            Ok(EngineConfig::default())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct Rejection {
    kind: &'static str,
    message: String,
}

fn print_rejection(err: &TransformError) -> anyhow::Result<()> {
    print_json(&Rejection {
        kind: err.kind(),
        message: err.to_string(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Transform {
            text,
            ip,
            user_agent,
        } => {
            let engine = TransformEngine::new(config)?;
            match engine.transform(&TransformRequest::new(text, ip, user_agent)) {
                Ok(accepted) => print_json(&accepted)?,
                Err(e) => {
                    print_rejection(&e)?;
                    std::process::exit(2);
                }
            }
        }

        Commands::Repl { ip, user_agent } => {
            let sweeper_config = config.sweeper.clone();
            let engine = Arc::new(TransformEngine::new(config)?);
            let sweeper = sweeper_config
                .enabled
                .then(|| engine.spawn_sweeper(Duration::from_secs(sweeper_config.interval_secs)));
            tracing::info!(
                "REPL started for {} (sweeper {})",
                ip,
                if sweeper.is_some() { "on" } else { "off" }
            );

            run_repl(&engine, &ip, &user_agent).await?;

            if let Some(sweeper) = sweeper {
                sweeper.shutdown().await;
            }
            tracing::info!("REPL closed");
        }

        Commands::Check { text } => {
            let engine = TransformEngine::new(config)?;
            print_json(&engine.check_text(&text))?;
        }

        Commands::Validate { file } => {
            let content = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => std::io::read_to_string(std::io::stdin())?,
            };
            let value: serde_json::Value =
                serde_json::from_str(&content).context("DSL document is not valid JSON")?;

            let engine = TransformEngine::new(config)?;
            match engine.validate_dsl(&value) {
                Ok(dsl) => print_json(&dsl)?,
                Err(e) => {
                    print_rejection(&e)?;
                    std::process::exit(2);
                }
            }
        }

        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}

const REPL_HELP: &str = "\
Type a request, or one of:
  :undo [n]           detach the last n snapshots (default 1)
  :reset              detach the whole history
  :state              show session state
  :history            list active snapshots
  :audit [n]          show the last n audit entries (default 10)
  :stats              engine counters
  :ban <key> [secs]   ban ip:<addr> or session:<id>; permanent without secs
  :unban <key>        lift a ban
  :bans               list active bans
  :quit               exit";

async fn run_repl(engine: &TransformEngine, ip: &str, user_agent: &str) -> anyhow::Result<()> {
    println!("Quill REPL. Type :help for commands.");

    let mut session_id: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix(':') {
            let mut parts = command.split_whitespace();
            let name = parts.next().unwrap_or_default();
            let args: Vec<&str> = parts.collect();

            if name == "quit" || name == "q" {
                break;
            }
            if let Err(e) = run_command(engine, session_id.as_deref(), name, &args) {
                println!("error: {:#}", e);
            }
            continue;
        }

        let mut request = TransformRequest::new(line, ip, user_agent);
        request.session_id = session_id.clone();

        match engine.transform(&request) {
            Ok(accepted) => {
                if session_id.as_deref() != Some(accepted.session_id.as_str()) {
                    println!("session {}", accepted.session_id);
                    session_id = Some(accepted.session_id.clone());
                }
                println!("accepted {}", accepted.snapshot.id);
                print_json(&accepted.dsl)?;
            }
            Err(e) => println!("rejected [{}] {}", e.kind(), e),
        }
    }

    Ok(())
}

fn run_command(
    engine: &TransformEngine,
    session_id: Option<&str>,
    name: &str,
    args: &[&str],
) -> anyhow::Result<()> {
    let session = || session_id.context("no session yet; send a request first");

    match name {
        "help" | "h" => println!("{}", REPL_HELP),
        "undo" => {
            let steps = match args.first() {
                Some(n) => n.parse().context("steps must be a number")?,
                None => 1,
            };
            print_json(&engine.undo(session()?, steps)?)?;
        }
        "reset" => print_json(&engine.reset(session()?)?)?,
        "state" => print_json(&engine.state(session()?)?)?,
        "history" => {
            for snapshot in engine.history(session()?)? {
                println!(
                    "{}  {} change(s)  {}",
                    snapshot.id,
                    snapshot.dsl.len(),
                    snapshot.metadata.note.unwrap_or_default()
                );
            }
        }
        "audit" => {
            let n = match args.first() {
                Some(n) => n.parse().context("count must be a number")?,
                None => 10,
            };
            for entry in engine.audit().recent(n) {
                println!(
                    "#{} {} {} {} {}",
                    entry.id,
                    entry.level,
                    entry.event,
                    entry.session_id.unwrap_or_else(|| "-".to_string()),
                    entry.data
                );
            }
        }
        "stats" => print_json(&engine.stats())?,
        "ban" => {
            let key: LimitKey = args.first().context("usage: :ban <key> [secs]")?.parse()?;
            let duration = match args.get(1) {
                Some(secs) => Some(Duration::from_secs(
                    secs.parse().context("secs must be a number")?,
                )),
                None => None,
            };
            print_json(&engine.ban(&key, "repl", duration))?;
        }
        "unban" => {
            let key: LimitKey = args.first().context("usage: :unban <key>")?.parse()?;
            println!("{}", if engine.unban(&key) { "unbanned" } else { "not banned" });
        }
        "bans" => {
            for (key, ban) in engine.bans() {
                let until = ban
                    .expires_at
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "permanent".to_string());
                println!("{}  {}  until {}", key, ban.reason, until);
            }
        }
        other => println!("unknown command :{} (try :help)", other),
    }

    Ok(())
}
