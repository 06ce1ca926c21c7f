//! phone-bridge: host adapter port and SMS store maintenance.
//!
//! `serve` speaks the bridge protocol on stdin/stdout using length-prefixed
//! JSON frames:
//!   [4-byte big-endian length][request JSON]
//!   [4-byte big-endian length][response JSON]
//!
//! The other subcommands operate on the SMS store in `--data-dir`.
//! Logs go to stderr so they don't corrupt the frame stream.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use phone_bridge::phone::extract_reply;
use phone_bridge::transport::{spawn_frame_reader, FramedOutbound};
use phone_bridge::{
    AdapterConfig, HostAdapter, HostEnvironment, LocalStorage, Origin, RetentionPolicy, SmsStore,
};

// ── CLI ───────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "phone-bridge", about = "Phone/host bridge and SMS store")]
struct Cli {
    /// Directory for the redb database.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer bridge requests read from stdin, with no host surfaces attached.
    Serve {
        /// Origin the peer on stdin is trusted as.
        #[arg(long, default_value = "stdio")]
        origin: String,
        #[arg(long, default_value_t = 8000)]
        processing_limit_ms: u64,
    },
    /// Record an outgoing text.
    Send { contact: String, text: String },
    /// Record an incoming text.
    Receive { contact: String, text: String },
    /// Record the marked reply in host output read from stdin.
    Ingest { contact: String },
    /// Print the most recent messages of a thread.
    Thread {
        contact: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Mark a thread, or one message in it, as read.
    Read {
        contact: String,
        #[arg(long)]
        id: Option<Uuid>,
    },
    /// Unread count for one contact, or for all.
    Unread { contact: Option<String> },
    /// List threads, most recent first.
    Contacts,
    /// Empty one thread.
    Clear { contact: String },
    /// Write the whole store as JSON to stdout.
    Export,
    /// Replace the whole store with a JSON export.
    Import { file: PathBuf },
    /// Delete every thread.
    Reset,
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── Serve ─────────────────────────────────────────────────────────────

async fn serve(origin: String, processing_limit: Duration) -> Result<()> {
    if processing_limit.is_zero() {
        bail!("processing limit must be positive");
    }
    let origin = Origin::new(origin);
    let config = AdapterConfig {
        processing_limit,
        ..AdapterConfig::new(origin.clone())
    };
    let adapter = Arc::new(HostAdapter::new(config, HostEnvironment::headless()));

    let inbound = spawn_frame_reader(tokio::io::stdin(), origin);
    let outbound = Arc::new(FramedOutbound::new(tokio::io::stdout()));
    adapter.serve(outbound, inbound).await;

    info!("stdin closed, shutting down");
    Ok(())
}

// ── Store commands ────────────────────────────────────────────────────

fn run_store_command(store: &mut SmsStore, command: Command) -> Result<()> {
    match command {
        Command::Serve { .. } => bail!("serve does not operate on the store"),

        Command::Send { contact, text } => print_json(&store.add_message(&contact, &text, true)?),

        Command::Receive { contact, text } => {
            print_json(&store.add_message(&contact, &text, false)?)
        }

        Command::Ingest { contact } => {
            let mut output = String::new();
            io::stdin()
                .read_to_string(&mut output)
                .context("reading host output")?;
            match extract_reply(&output) {
                Some(reply) => print_json(&store.add_message(&contact, reply, false)?),
                None => bail!("no marked reply in host output"),
            }
        }

        Command::Thread { contact, limit } => print_json(&store.conversation(&contact, limit)),

        Command::Read { contact, id } => {
            let changed = store.mark_as_read(&contact, id)?;
            print_json(&serde_json::json!({ "marked": changed }))
        }

        Command::Unread { contact } => {
            let unread = match contact {
                Some(c) => store.unread_count(&c),
                None => store.total_unread_count(),
            };
            print_json(&serde_json::json!({ "unread": unread }))
        }

        Command::Contacts => print_json(&store.contacts()),

        Command::Clear { contact } => {
            if !store.clear_conversation(&contact)? {
                bail!("no thread for {contact}");
            }
            Ok(())
        }

        Command::Export => {
            println!("{}", store.export_all()?);
            Ok(())
        }

        Command::Import { file } => {
            let data = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let contacts = store.import_all(&data).context("importing sms data")?;
            info!(contacts, "import complete");
            Ok(())
        }

        Command::Reset => Ok(store.reset()?),
    }
}

// ── Main ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Logs to stderr so stdout stays clean for frames and JSON output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Command::Serve {
        origin,
        processing_limit_ms,
    } = cli.command
    {
        info!(%origin, "phone-bridge serving on stdio");
        return serve(origin, Duration::from_millis(processing_limit_ms)).await;
    }

    info!(data_dir = %cli.data_dir.display(), "opening sms store");
    let storage = LocalStorage::open(&cli.data_dir)
        .with_context(|| format!("opening storage in {}", cli.data_dir.display()))?;
    let mut store = SmsStore::open(storage, RetentionPolicy::default())?;
    run_store_command(&mut store, cli.command)
}
