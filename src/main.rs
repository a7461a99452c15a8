// ABOUTME: CLI entry point for mot-warehouse-sync
// ABOUTME: Parses commands and routes to the sync engine components

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use mot_warehouse_sync::auth::TokenCache;
use mot_warehouse_sync::config::{self, AuthConfig, FeedConfig, SyncConfig, WarehouseConfig};
use mot_warehouse_sync::feed::{DataPuller, FeedClient};
use mot_warehouse_sync::normalize::Normalizer;
use mot_warehouse_sync::runner::{RunMode, SyncRunner};
use mot_warehouse_sync::warehouse::{self, StageMode, Uploader};

#[derive(Parser)]
#[command(name = "mot-warehouse-sync")]
#[command(about = "Synchronizes the MOT vehicle-history feed into a warehouse table", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct AuthArgs {
    /// OAuth2 client id (falls back to MOT_CLIENT_ID env)
    #[arg(long, env = "MOT_CLIENT_ID", hide_env_values = true)]
    client_id: String,
    /// OAuth2 client secret (falls back to MOT_CLIENT_SECRET env)
    #[arg(long, env = "MOT_CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,
    /// Token endpoint URL (falls back to MOT_TOKEN_URL env)
    #[arg(long, env = "MOT_TOKEN_URL")]
    token_url: String,
    /// Scope requested in the client-credentials exchange
    #[arg(long, env = "MOT_SCOPE_URL")]
    scope: String,
    /// Token cache location (defaults under ~/.mot-warehouse-sync)
    #[arg(long)]
    cache_file: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct FeedArgs {
    /// Manifest endpoint URL
    #[arg(long, env = "MOT_MANIFEST_URL", default_value = config::DEFAULT_MANIFEST_URL)]
    manifest_url: String,
    /// API key sent alongside the bearer token
    #[arg(long, env = "MOT_API_KEY", hide_env_values = true)]
    api_key: String,
}

#[derive(Args, Clone)]
struct StorageArgs {
    /// Directory for downloads and normalized period files
    #[arg(long, env = "MOT_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct WarehouseArgs {
    /// Warehouse connection URL
    #[arg(long, env = "WAREHOUSE_URL", hide_env_values = true)]
    warehouse_url: String,
    /// Schema holding the main and staging tables
    #[arg(long, default_value = "public")]
    warehouse_schema: String,
    /// Main table name; the staging table name derives from it
    #[arg(long, default_value = "mot_history")]
    table: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RunModeArg {
    Daily,
    Weekly,
}

impl From<RunModeArg> for RunMode {
    fn from(mode: RunModeArg) -> Self {
        match mode {
            RunModeArg::Daily => RunMode::Daily,
            RunModeArg::Weekly => RunMode::Weekly,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PullTarget {
    /// Only the chronologically last delta entry
    LatestDelta,
    /// Every bulk snapshot entry
    Bulk,
    /// Every delta entry
    Deltas,
}

#[derive(Subcommand)]
enum Commands {
    /// One-time full load: fetch the bulk snapshot and create the main table
    Bootstrap {
        #[command(flatten)]
        auth: AuthArgs,
        #[command(flatten)]
        feed: FeedArgs,
        #[command(flatten)]
        storage: StorageArgs,
        #[command(flatten)]
        warehouse: WarehouseArgs,
    },
    /// Incremental synchronization run
    Run {
        /// Daily merges the latest delta; weekly catches up on all of them
        #[arg(long, value_enum, default_value = "daily")]
        mode: RunModeArg,
        #[command(flatten)]
        auth: AuthArgs,
        #[command(flatten)]
        feed: FeedArgs,
        #[command(flatten)]
        storage: StorageArgs,
        #[command(flatten)]
        warehouse: WarehouseArgs,
    },
    /// Transfer manifest entries into the data directory
    Pull {
        #[arg(value_enum)]
        target: PullTarget,
        #[command(flatten)]
        auth: AuthArgs,
        #[command(flatten)]
        feed: FeedArgs,
        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Normalize every outstanding period in the data directory
    Normalize {
        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Project a normalized period file into the fixed CSV column set
    Csv {
        /// Normalized NDJSON input file
        file: PathBuf,
        /// Output path (defaults to the input with a .csv extension)
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Load one normalized period file into the staging table
    Stage {
        /// Normalized NDJSON input file
        file: PathBuf,
        /// Append to existing staging contents instead of replacing them
        #[arg(long)]
        append: bool,
        #[command(flatten)]
        warehouse: WarehouseArgs,
    },
    /// Reconcile staging into the main table and drop staging
    Merge {
        #[command(flatten)]
        warehouse: WarehouseArgs,
    },
    /// Create the main table from a normalized bulk snapshot file
    CreateTable {
        /// Normalized NDJSON bulk file
        file: PathBuf,
        #[command(flatten)]
        warehouse: WarehouseArgs,
    },
    /// Inspect or clear the persisted token cache
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
        #[command(flatten)]
        auth: AuthArgs,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Report whether the cached token is still valid
    Status,
    /// Acquire a token (silently when possible) and show its expiry
    Token,
    /// Remove the persisted token cache to force re-authentication
    Clear,
}

fn auth_config(args: &AuthArgs) -> Result<AuthConfig> {
    let cache_path = match &args.cache_file {
        Some(path) => path.clone(),
        None => config::default_cache_path()?,
    };
    Ok(AuthConfig {
        client_id: args.client_id.clone(),
        client_secret: args.client_secret.clone(),
        token_url: args.token_url.clone(),
        scope: args.scope.clone(),
        cache_path,
    })
}

fn feed_config(args: &FeedArgs) -> FeedConfig {
    FeedConfig {
        manifest_url: args.manifest_url.clone(),
        api_key: args.api_key.clone(),
    }
}

fn data_dir(args: &StorageArgs) -> Result<PathBuf> {
    match &args.data_dir {
        Some(dir) => Ok(dir.clone()),
        None => config::default_data_dir(),
    }
}

fn warehouse_config(args: &WarehouseArgs) -> WarehouseConfig {
    WarehouseConfig {
        url: args.warehouse_url.clone(),
        schema: args.warehouse_schema.clone(),
        table: args.table.clone(),
    }
}

fn sync_config(
    auth: &AuthArgs,
    feed: &FeedArgs,
    storage: &StorageArgs,
    warehouse: &WarehouseArgs,
) -> Result<SyncConfig> {
    Ok(SyncConfig {
        auth: auth_config(auth)?,
        feed: feed_config(feed),
        data_dir: data_dir(storage)?,
        warehouse: warehouse_config(warehouse),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log, which defaults to "info"
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Bootstrap {
            auth,
            feed,
            storage,
            warehouse,
        } => {
            let runner = SyncRunner::new(sync_config(&auth, &feed, &storage, &warehouse)?);
            let stats = runner.bootstrap().await?;
            println!(
                "Bootstrap complete: {} rows loaded from {} period(s) in {}ms",
                stats.rows_merged, stats.periods_merged, stats.duration_ms
            );
            Ok(())
        }
        Commands::Run {
            mode,
            auth,
            feed,
            storage,
            warehouse,
        } => {
            let runner = SyncRunner::new(sync_config(&auth, &feed, &storage, &warehouse)?);
            let stats = runner.run(mode.into()).await?;
            println!(
                "Run complete: {} period(s) merged, {} records normalized, {} rows merged in {}ms",
                stats.periods_merged,
                stats.records_normalized,
                stats.rows_merged,
                stats.duration_ms
            );
            if !stats.errors.is_empty() {
                println!("Skipped {} malformed entries (see log)", stats.errors.len());
            }
            Ok(())
        }
        Commands::Pull {
            target,
            auth,
            feed,
            storage,
        } => {
            let mut tokens = TokenCache::new(auth_config(&auth)?)?;
            let token = tokens.acquire(false).await?;

            let client = FeedClient::new(feed_config(&feed))?;
            let puller = DataPuller::new(client, data_dir(&storage)?);

            match target {
                PullTarget::LatestDelta => match puller.pull_latest_delta(&token).await? {
                    Some(path) => println!("Transferred {:?}", path),
                    None => println!("No delta files available"),
                },
                PullTarget::Bulk => {
                    let files = puller.pull_bulk(&token).await?;
                    println!("Transferred {} bulk file(s)", files.len());
                }
                PullTarget::Deltas => {
                    let files = puller.pull_deltas(&token).await?;
                    println!("Transferred {} delta file(s)", files.len());
                }
            }
            Ok(())
        }
        Commands::Normalize { storage } => {
            let dir = data_dir(&storage)?;

            // Expansion makes periods normalizable, so the standalone
            // command performs it too
            mot_warehouse_sync::feed::expand_archives(&dir)?;

            let outcome = Normalizer::new(dir).run()?;
            println!(
                "Normalized {} records into {} period file(s)",
                outcome.records,
                outcome.files.len()
            );
            if !outcome.errors.is_empty() {
                println!(
                    "Skipped {} malformed entries (see log)",
                    outcome.errors.len()
                );
            }
            Ok(())
        }
        Commands::Csv {
            file,
            output,
            storage,
        } => {
            let output = output.unwrap_or_else(|| file.with_extension("csv"));
            let normalizer = Normalizer::new(data_dir(&storage)?);
            let rows = normalizer.project_csv(&file, &output)?;
            println!("Projected {} rows into {:?}", rows, output);
            Ok(())
        }
        Commands::Stage {
            file,
            append,
            warehouse: warehouse_args,
        } => {
            let client = warehouse::connect(&warehouse_args.warehouse_url).await?;
            let uploader = Uploader::new(&client, warehouse_config(&warehouse_args))?;
            let mode = if append {
                StageMode::Append
            } else {
                StageMode::Truncate
            };
            let rows = uploader.stage(&file, mode).await?;
            println!("Staged {} rows", rows);
            Ok(())
        }
        Commands::Merge {
            warehouse: warehouse_args,
        } => {
            let client = warehouse::connect(&warehouse_args.warehouse_url).await?;
            let uploader = Uploader::new(&client, warehouse_config(&warehouse_args))?;
            let affected = uploader.merge().await?;
            println!("Merge complete: {} rows affected", affected);
            Ok(())
        }
        Commands::CreateTable {
            file,
            warehouse: warehouse_args,
        } => {
            let client = warehouse::connect(&warehouse_args.warehouse_url).await?;
            let uploader = Uploader::new(&client, warehouse_config(&warehouse_args))?;
            let rows = uploader.create_main_table(&file).await?;
            println!("Created main table with {} rows", rows);
            Ok(())
        }
        Commands::Auth { command, auth } => {
            let mut tokens = TokenCache::new(auth_config(&auth)?)
                .context("Failed to initialize token cache")?;
            match command {
                AuthCommands::Status => {
                    if tokens.expired_on_disk() {
                        println!("Cached token is expired or missing.");
                    } else {
                        println!("Cached token is valid.");
                    }
                }
                AuthCommands::Token => {
                    let token = tokens.acquire(false).await?;
                    println!("Token scope:   {}", token.scope);
                    println!("Token expires: {}", token.expires_at.to_rfc3339());
                }
                AuthCommands::Clear => {
                    tokens.clear()?;
                    println!("Token cache cleared.");
                }
            }
            Ok(())
        }
    }
}
