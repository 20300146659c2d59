//! redeemer - reconcile content-provider keys against an owned platform library
//!
//! Thin CLI over `redeemer-core`. Collaborators are a Steam HTTP client and a
//! JSON key file; session material comes from flags or the environment.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use redeemer_core::catalog::CatalogCache;
use redeemer_core::completion::CompletionTracker;
use redeemer_core::config::{Config, LogFormat};
use redeemer_core::engine::{Collaborators, Engine};
use redeemer_core::error::{EXIT_CANCELLED, EXIT_FAILURE, format_error_with_remediation};
use redeemer_core::export::{ExportFilter, export_keys, write_csv};
use redeemer_core::friend::FriendClassifier;
use redeemer_core::ledger::Ledger;
use redeemer_core::logging::{LogError, init_logging};
use redeemer_core::redemption::{KeySource, Shutdown};
use redeemer_core::resolver::OwnershipResolver;
use tokio::sync::watch;
use tracing::{info, warn};

mod keysource;
mod output;
mod steam;

use keysource::FileKeySource;
use steam::{SteamClient, SteamCredentials};

/// redeemer - decide which keys are safe to redeem, redeem them, and keep a ledger
#[derive(Parser, Debug)]
#[command(name = "redeemer")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (default: ./redeemer.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the ledger files and completion record
    #[arg(long, global = true, env = "REDEEMER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Platform credentials. Never obtained by this tool, only passed through.
#[derive(Args, Debug, Clone)]
struct PlatformArgs {
    /// Steam Web API key
    #[arg(long, env = "REDEEMER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Store `sessionid` cookie
    #[arg(long, env = "REDEEMER_SESSION_ID", hide_env_values = true)]
    session_id: Option<String>,

    /// Store `steamLoginSecure` cookie
    #[arg(long, env = "REDEEMER_LOGIN_SECURE", hide_env_values = true)]
    login_secure: Option<String>,

    /// Platform account id; also keys the owned-apps cache
    #[arg(long, env = "REDEEMER_USER_ID", default_value = "default")]
    user_id: String,

    /// Web API host
    #[arg(long, env = "REDEEMER_API_BASE", default_value = steam::API_BASE, hide = true)]
    api_base: String,

    /// Store host
    #[arg(long, env = "REDEEMER_STORE_BASE", default_value = steam::STORE_BASE, hide = true)]
    store_base: String,
}

impl PlatformArgs {
    fn client(&self, config: &Config) -> Result<SteamClient> {
        let credentials = SteamCredentials {
            api_key: self.api_key.clone(),
            session_id: self.session_id.clone(),
            login_secure: self.login_secure.clone(),
        };
        Ok(SteamClient::new(credentials, config.catalog.page_size)?
            .with_base_urls(&self.api_base, &self.store_base))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify every key in a key file and redeem the safe ones
    Run {
        /// JSON key file
        #[arg(long)]
        keys: PathBuf,

        /// Print the plan without redeeming or writing the ledger
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        platform: PlatformArgs,
    },

    /// Print the friend and ownership classification of every key
    Classify {
        /// JSON key file
        #[arg(long)]
        keys: PathBuf,

        #[command(flatten)]
        platform: PlatformArgs,
    },

    /// Ledger maintenance
    #[command(subcommand)]
    Ledger(LedgerCommands),

    /// Catalog cache maintenance
    #[command(subcommand)]
    Catalog(CatalogCommands),

    /// Ledger counts, problematic queue size and completed bundles
    Status,

    /// Write the key file as CSV with ownership and ledger columns
    Export {
        /// JSON key file
        #[arg(long)]
        keys: PathBuf,

        /// Output CSV path
        #[arg(long)]
        out: PathBuf,

        /// Only keys for the redemption platform
        #[arg(long)]
        platform_only: bool,

        /// Only keys that have a value
        #[arg(long, conflicts_with = "unrevealed_only")]
        revealed_only: bool,

        /// Only keys without a value
        #[arg(long)]
        unrevealed_only: bool,

        /// Skip ownership columns instead of loading the catalog
        #[arg(long)]
        offline: bool,

        #[command(flatten)]
        platform: PlatformArgs,
    },
}

#[derive(Subcommand, Debug)]
enum LedgerCommands {
    /// Deduplicate the errored file and drop superseded rows
    Cleanup,

    /// List the keys the next run will retry
    Problematic,

    /// Move friend keys out of the errored file
    PromoteFriends,
}

#[derive(Subcommand, Debug)]
enum CatalogCommands {
    /// Drop the cached catalog and owned set, then rebuild them
    Refresh {
        #[command(flatten)]
        platform: PlatformArgs,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => report(&err),
    }
}

fn report(err: &anyhow::Error) -> ExitCode {
    if let Some(core) = err.downcast_ref::<redeemer_core::Error>() {
        eprintln!("{}", format_error_with_remediation(core));
        return exit_code(core.exit_code());
    }
    eprintln!("Error: {err:#}");
    exit_code(EXIT_FAILURE)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.general.data_dir.clone_from(dir);
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    config.validate().map_err(redeemer_core::Error::from)?;
    Ok(config)
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    match init_logging(&config.logging) {
        Ok(()) | Err(LogError::AlreadyInitialized) => {}
        Err(e) => eprintln!("warning: logging disabled: {e}"),
    }
    let json = cli.json;

    match cli.command {
        Commands::Run {
            keys,
            dry_run,
            platform,
        } => run(config, &keys, dry_run, &platform, json).await,
        Commands::Classify { keys, platform } => {
            let engine = build_engine(config, &keys, &platform)?;
            let plan = engine.plan().await?;
            output::classification(&plan, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ledger(command) => ledger_command(&config, command, json),
        Commands::Catalog(CatalogCommands::Refresh { platform }) => {
            let client = platform.client(&config)?;
            let cache = CatalogCache::new(config.cache_path(), config.catalog.clone());
            let catalog = cache.refresh(&client, &platform.user_id).await?;
            output::catalog(&catalog, &cache.catalog_path(), json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => status(&config, json),
        Commands::Export {
            keys,
            out,
            platform_only,
            revealed_only,
            unrevealed_only,
            offline,
            platform,
        } => {
            let filter = ExportFilter {
                platform_only,
                revealed: !unrevealed_only,
                unrevealed: !revealed_only,
            };
            export(&config, &keys, &out, filter, offline, &platform, json).await
        }
    }
}

fn build_engine(config: Config, keys: &Path, platform: &PlatformArgs) -> Result<Engine> {
    let client = Arc::new(platform.client(&config)?);
    let collaborators = Collaborators {
        catalog: client.clone(),
        redeemer: client,
        keys: Arc::new(FileKeySource::new(keys)),
    };
    Ok(Engine::new(config, collaborators, platform.user_id.clone())?)
}

async fn run(
    config: Config,
    keys: &Path,
    dry_run: bool,
    platform: &PlatformArgs,
    json: bool,
) -> Result<ExitCode> {
    let engine = build_engine(config, keys, platform)?;
    if dry_run {
        let plan = engine.plan().await?;
        output::plan(&plan, json)?;
        return Ok(ExitCode::SUCCESS);
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current step");
            let _ = tx.send(true);
        }
    });

    let summary = engine.run(Shutdown::new(rx)).await?;
    output::summary(&summary, json)?;
    if summary.cancelled {
        Ok(exit_code(EXIT_CANCELLED))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn open_ledger(config: &Config) -> Result<Ledger> {
    Ledger::open(&config.general.data_dir, &config.ledger).with_context(|| {
        format!(
            "opening ledger in {}",
            config.general.data_dir.display()
        )
    })
}

fn ledger_command(config: &Config, command: LedgerCommands, json: bool) -> Result<ExitCode> {
    let ledger = open_ledger(config)?;
    let format = config.redemption.key_format;
    match command {
        LedgerCommands::Cleanup => {
            let report = ledger.cleanup_errored(format)?;
            info!(
                before = report.before,
                after = report.after,
                "Errored ledger cleaned"
            );
            output::cleanup(&report, json)?;
        }
        LedgerCommands::Problematic => {
            let queue = ledger.load_problematic(format)?;
            output::problematic(&queue, json)?;
        }
        LedgerCommands::PromoteFriends => {
            let classifier =
                FriendClassifier::load(&config.friend_patterns_path(), config.friend.auto_threshold)
                    .map_err(redeemer_core::Error::from)?;
            let promoted = ledger.promote_friend_keys_from_errored(&classifier)?;
            output::promoted(&promoted, json)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn status(config: &Config, json: bool) -> Result<ExitCode> {
    let ledger = open_ledger(config)?;
    let counts = ledger.snapshot()?.counts();
    let problematic = ledger.load_problematic(config.redemption.key_format)?.len();
    let completion = CompletionTracker::open(ledger.dir());
    let completed: Vec<&str> = completion.completed().collect();
    output::status(ledger.dir(), &counts, problematic, &completed, json)?;
    Ok(ExitCode::SUCCESS)
}

async fn export(
    config: &Config,
    keys: &Path,
    out: &Path,
    filter: ExportFilter,
    offline: bool,
    platform: &PlatformArgs,
    json: bool,
) -> Result<ExitCode> {
    let batch = FileKeySource::new(keys).load().await?;
    for failure in &batch.failures {
        warn!(failure = %failure, "Key file entry skipped");
    }
    let snapshot = open_ledger(config)?.snapshot()?;

    let rows = if offline {
        export_keys(&batch.keys, &snapshot, None, filter)
    } else {
        let client = platform.client(config)?;
        let cache = CatalogCache::new(config.cache_path(), config.catalog.clone());
        let catalog = cache.load_or_build(&client, &platform.user_id).await?;
        let resolver = OwnershipResolver::new(config.matching.clone());
        export_keys(&batch.keys, &snapshot, Some((&resolver, &catalog)), filter)
    };

    write_csv(out, &rows).with_context(|| format!("writing {}", out.display()))?;
    output::exported(rows.len(), out, json)?;
    Ok(ExitCode::SUCCESS)
}
