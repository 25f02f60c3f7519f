//! safe-session - deterministic smart-account sessions and subscription payments
//!
//! # WARNING
//! - `init` and `pay` submit real on-chain transactions through the relay.
//! - A timed-out relay transaction may still land. Check `status` before retrying.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info};

use safe_session::cli::commands;
use safe_session::config::Config;

/// Deterministic smart-account sessions and subscription payments
#[derive(Parser)]
#[command(name = "safe-session")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "safe-session.toml")]
    config: String,

    /// Owner private key file (hex, chmod 600)
    #[arg(long, env = "OWNER_KEY_PATH", global = true)]
    key: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the owner's deterministic account address
    Address {
        /// Derive for this owner instead of the configured key
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show deployment, approvals and credential status
    Status,

    /// Deploy, approve and obtain an API credential as needed
    Init,

    /// Clear the cached API credential
    Logout,

    /// Pay for a subscription tier from the account
    Pay {
        /// Tier name (e.g. basic, pro, premium)
        tier: String,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Verify a payment transaction against the treasury
    Verify {
        /// Transaction hash
        tx: String,

        /// Expected amount in settlement token units
        amount: f64,
    },

    /// Verify a payment and credit it to an owner
    Credit {
        /// Owner address
        owner: String,

        /// Tier purchased
        tier: String,

        /// Transaction hash
        tx: String,
    },

    /// Show an owner's subscription
    Subscription {
        /// Owner address
        owner: String,
    },

    /// Consume one generation from an owner's quota
    Usage {
        /// Owner address
        owner: String,
    },

    /// Show current configuration (secrets masked)
    Config,

    /// Check system health (RPC, relay, credential API, ledger)
    Health,
}

impl Commands {
    /// Whether the command signs with the owner key
    fn needs_key(&self) -> bool {
        matches!(
            self,
            Commands::Status | Commands::Init | Commands::Logout | Commands::Pay { .. }
        ) || matches!(self, Commands::Address { owner: None })
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        "safe_session=info"
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
    );

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    init_tracing(cli.json);

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Perform startup checks
    if cli.command.needs_key() {
        if let Err(e) = startup_checks(cli.key.as_deref()) {
            error!("Startup checks failed: {:#}", e);
            std::process::exit(1);
        }
    }

    let key = cli.key.as_deref();

    // Execute command
    let result = match cli.command {
        Commands::Address { owner } => commands::address(&config, key, owner).await,
        Commands::Status => commands::status(&config, key).await,
        Commands::Init => commands::init(&config, key).await,
        Commands::Logout => commands::logout(&config, key).await,
        Commands::Pay { tier, force } => commands::pay(&config, key, &tier, force).await,
        Commands::Verify { tx, amount } => commands::verify(&config, &tx, amount).await,
        Commands::Credit { owner, tier, tx } => commands::credit(&config, &owner, &tier, &tx).await,
        Commands::Subscription { owner } => commands::subscription(&config, &owner).await,
        Commands::Usage { owner } => commands::usage(&config, &owner).await,
        Commands::Config => commands::show_config(&config),
        Commands::Health => commands::health(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Perform startup safety checks on the owner key file
fn startup_checks(key: Option<&Path>) -> Result<()> {
    info!("Performing startup checks...");

    let path = key.ok_or_else(|| {
        anyhow::anyhow!("Owner key not configured. Pass --key or set OWNER_KEY_PATH")
    })?;

    if !path.exists() {
        return Err(anyhow::anyhow!("Owner key file not found: {}", path.display()));
    }

    // Check key file permissions (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let metadata = std::fs::metadata(path)
            .map_err(|e| anyhow::anyhow!("Cannot read key file {}: {}", path.display(), e))?;
        let mode = metadata.permissions().mode();

        // Check if file is readable by group or others (not 600)
        if mode & 0o077 != 0 {
            return Err(anyhow::anyhow!(
                "Key file {} has insecure permissions {:o}. \
                 Run 'chmod 600 {}' to fix. \
                 Refusing to run with a world-readable owner key.",
                path.display(),
                mode & 0o777,
                path.display()
            ));
        }

        info!("Key file permissions OK");
    }

    info!("Startup checks passed");
    Ok(())
}
