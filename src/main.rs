use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use dualmigrate_lib::channel::{EventChannel, SqliteChannel};
use dualmigrate_lib::config::MigratorConfig;
use dualmigrate_lib::db::open_pool;
use dualmigrate_lib::fixer::Fixer;
use dualmigrate_lib::pattern::Pattern;
use dualmigrate_lib::record::JsonRow;
use dualmigrate_lib::store::{RecordStore, SqliteRecordStore};
use dualmigrate_lib::validator::{ScanMode, Validator};

#[derive(Debug, Parser)]
#[command(name = "dualmigrate", about = "Online dual-write migration toolkit", version)]
struct Cli {
    /// Path to the JSON migrator configuration
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one validation pass over both directions and print the report.
    Validate {
        /// Only scan rows modified after the watermark.
        #[arg(long)]
        incremental: bool,
        /// Watermark in epoch milliseconds (incremental mode).
        #[arg(long, value_name = "MS")]
        since_ms: Option<i64>,
    },
    /// Consume inconsistency events and repair the target until Ctrl-C.
    Fix,
    /// Check that a pattern name is one the proxy accepts.
    CheckPattern {
        name: String,
    },
}

#[tokio::main]
async fn main() {
    dualmigrate_lib::logging::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    if let Command::CheckPattern { name } = &cli.command {
        return Ok(match name.parse::<Pattern>() {
            Ok(pattern) => {
                println!("{pattern}");
                0
            }
            Err(err) => {
                eprintln!("{err}");
                2
            }
        });
    }

    let path = cli
        .config
        .clone()
        .context("--config is required for this command")?;
    let config = MigratorConfig::load(&path)
        .with_context(|| format!("load config {}", path.display()))?;

    let base_pool = open_pool(&config.base_url, 4).await.context("open base store")?;
    let target_pool = open_pool(&config.target_url, 4)
        .await
        .context("open target store")?;
    let channel_pool = open_pool(config.channel_url(), 2)
        .await
        .context("open event channel")?;

    let base: Arc<dyn RecordStore<JsonRow>> =
        Arc::new(SqliteRecordStore::<JsonRow>::new(base_pool, config.table.clone())?);
    let target: Arc<dyn RecordStore<JsonRow>> =
        Arc::new(SqliteRecordStore::<JsonRow>::new(target_pool, config.table.clone())?);
    let channel = SqliteChannel::open(channel_pool)
        .await?
        .with_max_attempts(config.max_attempts);
    let channel: Arc<dyn EventChannel> = Arc::new(channel);

    match cli.command {
        Command::Validate {
            incremental,
            since_ms,
        } => {
            let mut validator_config = config.validator_config();
            if incremental {
                validator_config.mode = ScanMode::Incremental {
                    since_ms: since_ms.unwrap_or(config.since_ms),
                };
            }
            let (shutdown, rx) = watch::channel(false);
            spawn_ctrl_c(shutdown);
            let validator = Validator::new(base, target, channel)
                .with_topic(&config.topic)
                .with_config(validator_config)
                .with_shutdown(rx);
            let report = validator.validate().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }
        Command::Fix => {
            let (shutdown, rx) = watch::channel(false);
            spawn_ctrl_c(shutdown);
            let fixer = Fixer::new(base, target).with_op_timeout(config.op_timeout());
            let stats = fixer
                .run(
                    channel,
                    &config.topic,
                    config.batch_size,
                    config.poll_interval(),
                    rx,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(0)
        }
        Command::CheckPattern { .. } => Ok(0),
    }
}

fn spawn_ctrl_c(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: "dualmigrate", event = "shutdown_requested");
            let _ = shutdown.send(true);
        }
    });
}
