//! syncctl - Command-line front end for the drivesync engine
//!
//! Keeps a local SQLite collection store in sync with the drivesync folder in
//! the user's remote drive.
//!
//! # Commands
//!
//! - `connect` - Sign in and create the remote application folder
//! - `disconnect` - Sign out and forget the session
//! - `status` - Show the restored sync state
//! - `export` - Push local tables to the remote drive
//! - `import` - Pull remote tables and merge them into the local store
//! - `sync` - Pull then push, for one table or all of them
//! - `attach` / `url` - Upload an attachment, resolve its download URL

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use drivesync::auth::{CredentialManager, OAuthProvider};
use drivesync::drive::GraphDriveClient;
use drivesync::models::SyncState;
use drivesync::storage::{FileKeyValueStore, SessionStore, SqliteCollectionStore};
use drivesync::sync::SyncOrchestrator;
use drivesync::{DriveCredentials, EngineConfig};

/// Default local database file in the config directory
const DEFAULT_DB: &str = "collections.sqlite";

/// Sync local JSON tables with a remote drive folder.
#[derive(Parser)]
#[command(name = "syncctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the local SQLite collection store
    #[arg(global = true, long)]
    db: Option<PathBuf>,

    /// User id recorded in the export manifest
    #[arg(global = true, short, long, default_value = "local")]
    user: String,

    /// Remote application folder
    #[arg(global = true, long)]
    folder: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and create the remote application folder
    Connect,

    /// Sign out and forget the session
    Disconnect,

    /// Show the sync state
    Status {
        /// Print the state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Push local tables to the remote drive
    Export {
        /// Only export this table
        #[arg(short, long)]
        table: Option<String>,
    },

    /// Pull remote tables and merge them into the local store
    Import {
        /// Only import this table
        #[arg(short, long)]
        table: Option<String>,
    },

    /// Pull then push
    Sync {
        /// Only sync this table
        #[arg(short, long)]
        table: Option<String>,
    },

    /// Upload a file as an attachment of a record
    Attach {
        record_type: String,
        record_id: String,
        file: PathBuf,
    },

    /// Resolve an attachment to a download URL
    Url { file_name: String },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Err(e) = config::init() {
        warn!("Failed to initialize config directory: {}", e);
    }

    let engine = build_engine(&cli)?;
    engine.restore();

    let result = dispatch(&engine, &cli);
    engine.shutdown();
    result
}

fn build_engine(cli: &Cli) -> Result<SyncOrchestrator> {
    let credentials = match DriveCredentials::load() {
        Ok(creds) => creds,
        Err(e) => {
            if let Some(path) = DriveCredentials::default_credentials_path() {
                warn!(
                    "To configure drive access, either:\n\
                     1. Place your OAuth client settings at: {}\n\
                     2. Or set the environment variable DRIVESYNC_CLIENT_ID",
                    path.display()
                );
            }
            return Err(e.context("Drive credentials not found"));
        }
    };

    let mut engine_config = EngineConfig::default();
    if let Some(folder) = &cli.folder {
        engine_config = engine_config.with_app_folder(folder.as_str());
    }

    let kv = Arc::new(FileKeyValueStore::open_default()?);
    let sessions = SessionStore::new(kv, engine_config.session_ttl);

    let provider = Arc::new(OAuthProvider::new(&credentials)?);
    let manager = CredentialManager::new(provider, sessions.clone(), &engine_config);
    let drive = Arc::new(GraphDriveClient::new(Arc::new(manager.clone())));

    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => config::config_path(DEFAULT_DB).context("Could not determine config directory")?,
    };
    let collections = Arc::new(SqliteCollectionStore::new(&db_path)?);
    info!("Using local store at {}", db_path.display());

    Ok(SyncOrchestrator::new(
        manager,
        drive,
        collections,
        sessions,
        engine_config,
    ))
}

fn dispatch(engine: &SyncOrchestrator, cli: &Cli) -> Result<()> {
    let user = cli.user.as_str();

    match &cli.command {
        Commands::Connect => {
            let info = engine.connect()?;
            println!("Connected as {}", info.username);
        }
        Commands::Disconnect => {
            engine.disconnect()?;
            println!("Disconnected");
        }
        Commands::Status { json } => {
            let connected = engine.check_connection();
            let state = engine.state();
            if *json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                print_state(&state, connected);
            }
        }
        Commands::Export { table: Some(table) } => {
            let export = engine.export_table(table, user)?;
            println!("Exported {} ({} records) to {}", export.table, export.record_count, export.path);
        }
        Commands::Export { table: None } => {
            let summary = engine.export_data(user)?;
            println!("Exported {} tables", summary.tables.len());
            report_errors(&summary.errors)?;
        }
        Commands::Import { table: Some(table) } => {
            let pull = engine.import_table(table)?;
            if !pull.found {
                println!("{} has not been exported yet", pull.table);
            } else {
                println!(
                    "{}: {} inserted, {} replaced, {} kept local",
                    pull.table, pull.inserted, pull.replaced, pull.kept_local
                );
            }
        }
        Commands::Import { table: None } => {
            let summary = engine.import_data(user)?;
            for pull in &summary.tables {
                println!(
                    "{}: {} inserted, {} replaced, {} kept local",
                    pull.table, pull.inserted, pull.replaced, pull.kept_local
                );
            }
            report_errors(&summary.errors)?;
        }
        Commands::Sync { table: Some(table) } => {
            let synced = engine.sync_table(table, user)?;
            println!(
                "{}: {} merged in, {} records pushed",
                table,
                synced.pull.inserted + synced.pull.replaced,
                synced.export.record_count
            );
        }
        Commands::Sync { table: None } => {
            let summary = engine.sync_all_tables(user)?;
            println!("Synced {} tables", summary.synced.len());
            report_errors(&summary.errors)?;
        }
        Commands::Attach {
            record_type,
            record_id,
            file,
        } => {
            let content = std::fs::read(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("Attachment path has no file name")?;
            let attachment = engine
                .attachments()
                .attach(record_type, record_id, name, &content)?;
            println!("{}", attachment.file_name);
        }
        Commands::Url { file_name } => {
            let url = engine.attachments().resolve_attachment_url(file_name)?;
            println!("{}", url);
        }
    }

    Ok(())
}

fn print_state(state: &SyncState, connected: bool) {
    match (&state.user_info, connected) {
        (Some(user), true) => println!("Connected as {}", user.username),
        _ => println!("Not connected"),
    }
    match state.last_sync_time {
        Some(at) => println!("Last sync: {}", at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")),
        None => println!("Last sync: never"),
    }
    if let Some(error) = &state.error {
        println!("Last error: {}", error);
    }
}

fn report_errors(errors: &[String]) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    for e in errors {
        eprintln!("  {}", e);
    }
    bail!("{} item(s) failed", errors.len())
}
