//! Command-line interface for callrec.
//!
//! Provides commands for preparing the database, replaying a scripted call
//! through a full recording session, and inspecting stored events and
//! artifacts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::SqliteStore;
use crate::config::RecorderConfig;
use crate::core::CallRecorder;
use crate::domain::TranscriptEvent;

/// callrec - Call recording and archival pipeline
#[derive(Parser, Debug)]
#[command(name = "callrec")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to $CALLREC_CONFIG or .callrec/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database schema
    InitDb {
        /// Also create the artifact table
        #[arg(long)]
        with_artifacts: bool,
    },

    /// Feed a scripted call (JSONL of transcript events) through a session
    Replay {
        /// Script file, one {"role","text","is_final","delay_ms"} per line
        script: PathBuf,

        /// Call ID (random if not provided)
        #[arg(long)]
        call_id: Option<String>,

        /// Room name
        #[arg(long, default_value = "replay")]
        room: String,

        /// Media session to record (defaults to the room)
        #[arg(long)]
        media_session: Option<String>,
    },

    /// List the stored events of a call
    Events {
        /// Call ID
        call_id: String,
    },

    /// List the recorded artifacts of a call
    Artifacts {
        /// Call ID
        call_id: String,
    },

    /// Show the resolved configuration (secrets redacted)
    Config,
}

/// One line of a replay script
#[derive(Debug, Deserialize)]
struct ScriptLine {
    #[serde(flatten)]
    event: TranscriptEvent,

    /// Pause before delivering this event
    #[serde(default)]
    delay_ms: u64,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = RecorderConfig::load(self.config.as_deref())?;

        match self.command {
            Commands::InitDb { with_artifacts } => init_db(&config, with_artifacts).await,
            Commands::Replay {
                script,
                call_id,
                room,
                media_session,
            } => replay(&config, &script, call_id, room, media_session).await,
            Commands::Events { call_id } => show_events(&config, &call_id).await,
            Commands::Artifacts { call_id } => show_artifacts(&config, &call_id).await,
            Commands::Config => show_config(&config),
        }
    }
}

/// Create the core tables, and the artifact table on request
async fn init_db(config: &RecorderConfig, with_artifacts: bool) -> Result<()> {
    let store = SqliteStore::open(&config.database_path)?;
    if with_artifacts {
        store.init_artifact_schema().await?;
    }

    println!("Database ready: {}", config.database_path.display());
    if with_artifacts {
        println!("Artifact table: created");
    }
    Ok(())
}

fn load_script(path: &Path) -> Result<Vec<ScriptLine>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script: {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Invalid script line {}: {}", i + 1, line))
        })
        .collect()
}

/// Run a scripted call end to end and print the shutdown outcome
async fn replay(
    config: &RecorderConfig,
    script: &Path,
    call_id: Option<String>,
    room: String,
    media_session: Option<String>,
) -> Result<()> {
    let lines = load_script(script)?;
    let call_id = call_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let media_session = media_session.unwrap_or_else(|| room.clone());

    let recorder = CallRecorder::from_config(config)?;
    let handle = recorder.call_started(&call_id, &room, &media_session).await;
    info!(%call_id, events = lines.len(), "Replaying script");

    for line in &lines {
        if line.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(line.delay_ms)).await;
        }
        if let Err(e) = handle.on_transcript(&line.event) {
            warn!(error = %e, "Event rejected");
        }
    }

    let outcome = recorder
        .call_ended(&call_id)
        .await
        .context("Session disappeared before shutdown")?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

/// Print stored events in sequence order
async fn show_events(config: &RecorderConfig, call_id: &str) -> Result<()> {
    let store = SqliteStore::open(&config.database_path)?;

    if let Some(call) = store.get_call(call_id).await? {
        println!("Call: {}  Room: {}", call.id, call.room);
        println!("Started: {}", call.started_at);
        match call.ended_at {
            Some(ended) => println!("Ended: {}", ended),
            None => println!("Ended: (open)"),
        }
        println!();
    }

    let messages = store.messages_for_call(call_id).await?;
    if messages.is_empty() {
        println!("No events found for call {}", call_id);
        return Ok(());
    }

    println!("{:<6} {:<8} {:<26} {}", "SEQ", "ROLE", "TIME", "TEXT");
    println!("{}", "-".repeat(75));
    for message in messages {
        println!(
            "{:<6} {:<8} {:<26} {}",
            message.sequence,
            message.role,
            message.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            message.text
        );
    }

    Ok(())
}

/// Print artifact rows for a call
async fn show_artifacts(config: &RecorderConfig, call_id: &str) -> Result<()> {
    let store = SqliteStore::open(&config.database_path)?;
    let artifacts = store.artifacts_for_call(call_id).await?;

    if artifacts.is_empty() {
        println!("No artifacts found for call {}", call_id);
        return Ok(());
    }

    println!("{:<12} {:>10} {}", "KIND", "BYTES", "LOCATION");
    println!("{}", "-".repeat(75));
    for artifact in artifacts {
        let size = artifact
            .size_bytes
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:>10} {}",
            artifact.kind.as_str(),
            size,
            artifact.location.uri()
        );
        if let Some(ref egress_id) = artifact.egress_id {
            println!("{:<12} {:>10} egress {}", "", "", egress_id);
        }
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(cfg: &RecorderConfig) -> Result<()> {
    println!("callrec configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Database:    {}", cfg.database_path.display());
    println!();

    match cfg.storage {
        Some(ref storage) => {
            println!("Object storage:");
            println!("  Bucket:      {}", storage.bucket);
            println!("  Region:      {}", storage.region);
            println!("  Endpoint:    {}", storage.endpoint.as_deref().unwrap_or("(aws)"));
            println!("  Prefix:      {}", storage.prefix);
            println!("  Path style:  {}", storage.force_path_style);
            println!("  SSE:         {}", storage.sse.as_deref().unwrap_or("(none)"));
            println!("  Credentials: {:?}", storage.credentials);
        }
        None => println!("Object storage: disabled"),
    }
    println!();

    match cfg.egress {
        Some(ref egress) => println!("Audio egress: {:?}", egress),
        None => println!("Audio egress: disabled"),
    }
    println!();

    println!("Batching:  size {} / every {}ms", cfg.batch.size, cfg.batch.interval_ms);
    println!(
        "Retry:     {} attempts, {}ms initial, {}ms max, x{}",
        cfg.retry.max_attempts,
        cfg.retry.initial_delay_ms,
        cfg.retry.max_delay_ms,
        cfg.retry.backoff_multiplier
    );
    println!(
        "Shutdown:  {}ms deadline (drain {}ms, upload {}ms, egress {}ms, bookkeeping {}ms)",
        cfg.shutdown.deadline_ms,
        cfg.shutdown.drain_timeout_ms,
        cfg.shutdown.upload_timeout_ms,
        cfg.shutdown.egress_stop_timeout_ms,
        cfg.shutdown.bookkeeping_timeout_ms
    );
    println!("Artifacts: {}", if cfg.artifacts_enabled { "enabled" } else { "disabled" });
    println!("Dedupe:    {}", cfg.dedupe_consecutive);

    Ok(())
}
