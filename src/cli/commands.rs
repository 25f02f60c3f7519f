//! CLI command implementations

use anyhow::{Context, Result};
use dialoguer::Confirm;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::account::{
    ApprovalChecker, ApprovalPolicy, CredentialStore, FileCredentialStore, LocalKeySigner,
    OwnerSigner, SerializedSigner,
};
use crate::account::approvals::ApprovalLevel;
use crate::chain::{ChainReader, FactoryParams, HttpRpcClient};
use crate::config::{parse_address, Config};
use crate::payment::{
    parse_tx_id, Checkout, PaymentVerifier, SqliteLedgerStore, Subscription, SubscriptionLedger,
    TierCatalog, VerifierConfig,
};
use crate::relay::{self, HttpRelayClient, RelayExecutor};
use crate::session::{SessionManager, SessionState};

/// Load the owner key named by `--key` / `OWNER_KEY_PATH`
fn load_signer(config: &Config, key: Option<&Path>) -> Result<Arc<dyn OwnerSigner>> {
    let path = key.context("No owner key configured. Pass --key or set OWNER_KEY_PATH")?;
    let signer = LocalKeySigner::from_key_file(path, config.network.chain_id)?;
    Ok(Arc::new(signer))
}

fn chain_reader(config: &Config) -> Result<Arc<dyn ChainReader>> {
    Ok(Arc::new(HttpRpcClient::new(&config.network)?))
}

fn open_ledger(config: &Config) -> Result<SubscriptionLedger> {
    let store = SqliteLedgerStore::open(Path::new(&config.ledger.database_path))?;
    Ok(SubscriptionLedger::new(
        Arc::new(store),
        TierCatalog::from_config(&config.tiers),
        config.payment.renewal_days,
    ))
}

fn payment_verifier(config: &Config, reader: Arc<dyn ChainReader>) -> Result<PaymentVerifier> {
    Ok(PaymentVerifier::new(
        reader,
        VerifierConfig {
            token: parse_address(&config.token.address)?,
            decimals: config.token.decimals,
            tolerance: config.payment.tolerance,
        },
    ))
}

fn relay_client(
    config: &Config,
    signer: Arc<dyn OwnerSigner>,
    reader: Arc<dyn ChainReader>,
) -> Result<HttpRelayClient> {
    Ok(HttpRelayClient::new(
        &config.relay,
        config.network.chain_id,
        FactoryParams::from_config(&config.factory)?,
        &config.factory.domain_name,
        parse_address(&config.relay.multisend_address)?,
        signer,
        reader,
    )?)
}

fn print_subscription(subscription: &Subscription, ledger: &SubscriptionLedger) {
    let now = chrono::Utc::now();
    let quota = ledger.quota_for(subscription).ok();

    println!("Owner:       {}", subscription.owner);
    println!("Tier:        {}", subscription.tier);
    println!("Started:     {}", subscription.start_date);
    println!(
        "Expires:     {} ({})",
        subscription.end_date,
        if subscription.is_active(now) {
            "active"
        } else {
            "expired"
        }
    );
    match quota {
        Some(quota) => println!(
            "Usage:       {}/{} ({} remaining)",
            subscription.usage_count,
            quota,
            subscription.remaining(quota)
        ),
        None => println!("Usage:       {} (tier no longer offered)", subscription.usage_count),
    }
}

/// Show the owner's deterministic account address
pub async fn address(config: &Config, key: Option<&Path>, owner: Option<String>) -> Result<()> {
    let owner = match owner {
        Some(owner) => parse_address(&owner)?,
        None => load_signer(config, key)?.address(),
    };
    let factory = FactoryParams::from_config(&config.factory)?;

    println!("Owner:   {}", owner);
    println!("Account: {}", factory.account_for(owner));
    Ok(())
}

/// Show deployment, approval and credential status for the owner's account
pub async fn status(config: &Config, key: Option<&Path>) -> Result<()> {
    let signer = load_signer(config, key)?;
    let reader = chain_reader(config)?;
    let factory = FactoryParams::from_config(&config.factory)?;
    let owner = signer.address();
    let account = factory.account_for(owner);

    let relay = relay_client(config, SerializedSigner::new(signer), reader.clone())?;
    let checker = ApprovalChecker::new(
        reader,
        ApprovalPolicy::from_config(&config.token, &config.approvals)?,
    );

    println!("\n=== ACCOUNT STATUS ===\n");
    println!("Owner:    {}", owner);
    println!("Account:  {}", account);

    let deployed = relay.is_deployed(account).await?;
    println!("Deployed: {}", if deployed { "yes" } else { "no" });

    let approvals = checker.snapshot(account).await?;
    println!("\n=== APPROVALS ===\n");
    for entry in &approvals.entries {
        let level = match &entry.level {
            ApprovalLevel::Allowance(amount) => format!("allowance {}", amount),
            ApprovalLevel::Operator(flag) => format!("operator {}", flag),
        };
        println!(
            "  {} {} [{}]",
            entry.spender,
            level,
            if entry.sufficient { "OK" } else { "MISSING" }
        );
    }
    println!(
        "\nApprovals sufficient: {}",
        if approvals.is_sufficient() { "yes" } else { "no" }
    );

    let store = FileCredentialStore::new(&config.credentials.cache_path);
    let cached = store.get(owner)?.is_some();
    println!("Cached credential: {}", if cached { "yes" } else { "no" });

    Ok(())
}

/// Initialize the session: deploy, approve and obtain a credential as needed
pub async fn init(config: &Config, key: Option<&Path>) -> Result<()> {
    let signer = load_signer(config, key)?;
    let manager = SessionManager::from_config(config, signer)?;

    let mut updates = manager.subscribe();
    let progress = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let state = updates.borrow_and_update().clone();
            if state.is_in_flight() {
                println!("... {}", state.name());
            }
        }
    });

    let state = manager.init().await;
    drop(manager);
    progress.await.ok();

    match state {
        SessionState::Complete(session) => {
            println!("\nSession ready");
            println!("Account:    {}", session.account_address);
            println!("API key:    {}", session.credential.api_key);
            println!(
                "Sig. type:  {}",
                session.execution_client.signature_type()
            );
            Ok(())
        }
        SessionState::Idle {
            error: Some(failure),
        } => anyhow::bail!("Session initialization failed ({}): {}", failure.kind, failure.message),
        other => anyhow::bail!("Session ended in unexpected state {}", other),
    }
}

/// Forget the cached credential
pub async fn logout(config: &Config, key: Option<&Path>) -> Result<()> {
    let signer = load_signer(config, key)?;
    let owner = signer.address();
    FileCredentialStore::new(&config.credentials.cache_path).clear(owner)?;
    println!("Logged out {}", owner);
    Ok(())
}

/// Pay for a tier from the owner's account and credit it
pub async fn pay(config: &Config, key: Option<&Path>, tier: &str, force: bool) -> Result<()> {
    let treasury = config.treasury()?;
    let ledger = Arc::new(open_ledger(config)?);
    let price = ledger.tiers().get(tier)?.price;

    let signer: Arc<dyn OwnerSigner> = SerializedSigner::new(load_signer(config, key)?);
    let owner = signer.address();
    let reader = chain_reader(config)?;

    if !force {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Pay {} to {} for tier '{}'? This cannot be undone.",
                price, treasury, tier
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Payment cancelled by user");
            return Ok(());
        }
    }

    let relay = relay_client(config, signer, reader.clone())?;
    let checkout = Checkout::new(
        Arc::new(relay),
        payment_verifier(config, reader)?,
        ledger.clone(),
        FactoryParams::from_config(&config.factory)?,
        treasury,
        Duration::from_millis(config.relay.poll_interval_ms),
        Duration::from_millis(config.relay.confirm_timeout_ms),
    );

    let subscription = checkout.purchase(owner, tier).await?;

    println!("\nPayment credited\n");
    print_subscription(&subscription, &ledger);
    Ok(())
}

/// Verify a payment transaction against the treasury without crediting it
pub async fn verify(config: &Config, tx: &str, amount: f64) -> Result<()> {
    let tx_id = parse_tx_id(tx)?;
    let treasury = config.treasury()?;
    let verifier = payment_verifier(config, chain_reader(config)?)?;

    let payment = verifier.verify(tx_id, amount, treasury).await?;

    println!("Payment verified");
    println!("  Transaction: {}", payment.tx_id);
    println!("  Amount:      {}", payment.amount);
    println!("  From:        {}", payment.payer);
    println!("  To:          {}", payment.recipient);
    Ok(())
}

/// Verify a payment for a tier and credit it to `owner`
pub async fn credit(config: &Config, owner: &str, tier: &str, tx: &str) -> Result<()> {
    let owner = parse_address(owner)?;
    let tx_id = parse_tx_id(tx)?;
    let treasury = config.treasury()?;
    let ledger = open_ledger(config)?;
    let price = ledger.tiers().get(tier)?.price;

    if ledger.is_processed(&tx_id)? {
        warn!("Transaction {} was already credited", tx_id);
    }

    let verifier = payment_verifier(config, chain_reader(config)?)?;
    let payment = verifier.verify(tx_id, price, treasury).await?;
    let subscription = ledger.apply(owner, tier, &payment)?;

    println!("Payment credited\n");
    print_subscription(&subscription, &ledger);
    Ok(())
}

/// Show an owner's subscription
pub async fn subscription(config: &Config, owner: &str) -> Result<()> {
    let owner = parse_address(owner)?;
    let ledger = open_ledger(config)?;

    match ledger.subscription(owner)? {
        Some(subscription) => print_subscription(&subscription, &ledger),
        None => println!("No subscription for {}", owner),
    }
    Ok(())
}

/// Consume one generation from an owner's quota
pub async fn usage(config: &Config, owner: &str) -> Result<()> {
    let owner = parse_address(owner)?;
    let ledger = open_ledger(config)?;

    let subscription = ledger.record_usage(owner)?;
    print_subscription(&subscription, &ledger);
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Check connectivity to every external service
pub async fn health(config: &Config) -> Result<()> {
    println!("\n=== SYSTEM HEALTH CHECK ===\n");

    let mut all_healthy = true;

    print!("RPC Endpoint... ");
    match check_rpc(config).await {
        Ok(latency) => println!("OK ({}ms)", latency),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    print!("Relay... ");
    match relay::http::health_check(&config.relay).await {
        Ok(latency) => println!("OK ({}ms)", latency.as_millis()),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    print!("Credential API... ");
    match check_http(&format!("{}/time", config.credentials.api_url.trim_end_matches('/')), config).await {
        Ok(latency) => println!("OK ({}ms)", latency),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    print!("Ledger... ");
    match open_ledger(config) {
        Ok(_) => println!("OK ({})", config.ledger.database_path),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    print!("Treasury... ");
    match config.treasury() {
        Ok(treasury) => println!("{}", treasury),
        Err(_) => println!("NOT SET (payment commands disabled)"),
    }

    println!();
    if all_healthy {
        println!("All systems healthy!");
    } else {
        println!("Some systems are unhealthy. Check the errors above.");
    }

    Ok(())
}

async fn check_rpc(config: &Config) -> Result<u64> {
    let client = HttpRpcClient::new(&config.network)?;

    let start = Instant::now();
    let chain_id = client.chain_id().await?;
    let latency = start.elapsed().as_millis() as u64;

    if chain_id != config.network.chain_id {
        anyhow::bail!(
            "node is on chain {}, configured chain is {}",
            chain_id,
            config.network.chain_id
        );
    }

    Ok(latency)
}

async fn check_http(url: &str, config: &Config) -> Result<u64> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(config.network.timeout_ms))
        .build()?;

    let start = Instant::now();
    let response = client.get(url).send().await?;
    let latency = start.elapsed().as_millis() as u64;
    debug!("GET {} -> {}", url, response.status());

    if response.status().is_server_error() {
        anyhow::bail!("HTTP {}", response.status());
    }

    Ok(latency)
}
