use alloy::primitives::Address;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::account::{
    ApprovalChecker, ApprovalPolicy, Credential, CredentialIssuer, CredentialStore,
    ExecutionClient, FileCredentialStore, HttpCredentialApi, OwnerSigner, SerializedSigner,
};
use crate::chain::{ChainReader, FactoryParams, HttpRpcClient};
use crate::config::{parse_address, Config};
use crate::error::{Error, Result};
use crate::relay::{HttpRelayClient, RelayExecutor};

use super::{Session, SessionFailure, SessionState};

/// Fixed parameters of a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub chain_id: u64,
    pub factory: FactoryParams,
    /// Base URL of the trading API the execution client talks to
    pub api_url: String,
}

/// Drives one owner's account from unknown state to a ready session
pub struct SessionManager {
    settings: SessionSettings,
    signer: Arc<dyn OwnerSigner>,
    relay: Arc<dyn RelayExecutor>,
    approvals: ApprovalChecker,
    issuer: CredentialIssuer,
    store: Arc<dyn CredentialStore>,
    state: watch::Sender<SessionState>,
    in_flight: Mutex<()>,
}

impl SessionManager {
    /// `signer` should be the same instance the relay signs with, so that
    /// every component shares one signing queue
    pub fn new(
        settings: SessionSettings,
        signer: Arc<dyn OwnerSigner>,
        relay: Arc<dyn RelayExecutor>,
        approvals: ApprovalChecker,
        issuer: CredentialIssuer,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            settings,
            signer,
            relay,
            approvals,
            issuer,
            store,
            state,
            in_flight: Mutex::new(()),
        }
    }

    /// Wire HTTP collaborators from configuration.
    ///
    /// The signer is wrapped in a `SerializedSigner` shared by the relay and
    /// the credential issuer.
    pub fn from_config(config: &Config, signer: Arc<dyn OwnerSigner>) -> Result<Self> {
        let signer: Arc<dyn OwnerSigner> = SerializedSigner::new(signer);
        let reader: Arc<dyn ChainReader> = Arc::new(HttpRpcClient::new(&config.network)?);
        let factory = FactoryParams::from_config(&config.factory)?;
        let multisend = parse_address(&config.relay.multisend_address)
            .map_err(|e| Error::InvalidInput(e.to_string()))?;

        let relay = HttpRelayClient::new(
            &config.relay,
            config.network.chain_id,
            factory.clone(),
            &config.factory.domain_name,
            multisend,
            signer.clone(),
            reader.clone(),
        )?;

        let approvals = ApprovalChecker::new(
            reader,
            ApprovalPolicy::from_config(&config.token, &config.approvals)?,
        );

        let api = HttpCredentialApi::new(&config.credentials.api_url, config.network.timeout_ms)?;
        let issuer = CredentialIssuer::new(
            Arc::new(api),
            config.network.chain_id,
            config.credentials.auth_nonce,
        );

        let store = FileCredentialStore::new(&config.credentials.cache_path);

        Ok(Self::new(
            SessionSettings {
                chain_id: config.network.chain_id,
                factory,
                api_url: config.credentials.api_url.clone(),
            },
            signer,
            Arc::new(relay),
            approvals,
            issuer,
            Arc::new(store),
        ))
    }

    pub fn owner(&self) -> Address {
        self.signer.address()
    }

    /// Counterfactual account address of the owner
    pub fn account_address(&self) -> Address {
        self.settings.factory.account_for(self.owner())
    }

    /// Current state snapshot
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every transition
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Ready session, if initialization has completed
    pub fn session(&self) -> Option<Arc<Session>> {
        self.state.borrow().session()
    }

    fn transition(&self, next: SessionState) {
        debug!("Session {} -> {}", self.state.borrow().name(), next.name());
        self.state.send_replace(next);
    }

    /// Bring the session to `complete`.
    ///
    /// Returns immediately with the current state if the session is already
    /// complete or another initialization is running. Failures land in
    /// `idle` with the error attached; they are never silently dropped.
    pub async fn init(&self) -> SessionState {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Session init already in flight");
            return self.state();
        };

        if self.state.borrow().is_complete() {
            return self.state();
        }

        self.transition(SessionState::Checking);

        match self.run().await {
            Ok(session) => {
                info!(
                    "Session ready for {} (account {})",
                    self.owner(),
                    session.account_address
                );
                self.transition(SessionState::Complete(Arc::new(session)));
            }
            Err(e) => {
                error!("Session init failed: {}", e);
                self.transition(SessionState::Idle {
                    error: Some(SessionFailure::from(&e)),
                });
            }
        }

        self.state()
    }

    async fn run(&self) -> Result<Session> {
        self.ensure_network().await?;

        let owner = self.owner();
        let account = self.settings.factory.account_for(owner);
        info!("Checking account {} for owner {}", account, owner);

        if !self.relay.is_deployed(account).await? {
            self.transition(SessionState::Deploying);
            info!("Deploying account {}", account);
            let tx = self.relay.deploy(account).await?;
            let hash = tx.wait().await?;
            info!("Account {} deployed in {}", account, hash);
        }

        self.transition(SessionState::Approving);
        if !self.approvals.check_sufficient(account).await? {
            let ops = self.approvals.policy().approval_ops();
            info!("Granting {} approval(s) for {}", ops.len(), account);
            let tx = self.relay.execute(account, ops).await?;
            let hash = tx.wait().await?;
            info!("Approvals for {} landed in {}", account, hash);
        }

        self.transition(SessionState::ObtainingCredential);
        let credential = self.credential(owner).await?;

        let execution_client = ExecutionClient::new(
            &self.settings.api_url,
            self.settings.chain_id,
            credential.clone(),
            owner,
            account,
        );

        Ok(Session {
            execution_client,
            credential,
            account_address: account,
        })
    }

    /// Refuse to touch the relay while the signer is on another chain
    async fn ensure_network(&self) -> Result<()> {
        let actual = self.signer.chain_id().await?;
        let expected = self.settings.chain_id;
        if actual == expected {
            return Ok(());
        }

        warn!("Signer is on chain {}, requesting switch to {}", actual, expected);
        if let Err(e) = self.signer.request_chain_switch(expected).await {
            warn!("Chain switch request failed: {}", e);
        }

        Err(Error::WrongNetwork { expected, actual })
    }

    /// Cached credential, or a freshly issued one persisted before use
    async fn credential(&self, owner: Address) -> Result<Credential> {
        if let Some(credential) = self.store.get(owner)? {
            debug!("Using cached credential for {}", owner);
            return Ok(credential);
        }

        let credential = self.issuer.obtain(self.signer.as_ref()).await?;
        self.store.set(owner, &credential)?;
        Ok(credential)
    }

    /// Forget the cached credential and return to idle.
    ///
    /// Waits for an in-flight initialization to finish first.
    pub async fn logout(&self) -> Result<()> {
        let _guard = self.in_flight.lock().await;
        let owner = self.owner();
        self.store.clear(owner)?;
        self.transition(SessionState::default());
        info!("Logged out {}", owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::credentials::{CredentialApi, SignerProof};
    use crate::account::ops::SafeOperation;
    use crate::account::{LocalKeySigner, MemoryCredentialStore};
    use crate::config::{ApprovalConfig, TokenConfig};
    use crate::error::ErrorKind;
    use crate::relay::{RelayState, RelayStatusSource, RelayTransaction, TxHandle};
    use crate::testing::{DecliningSigner, MockChain, DEV_KEY};
    use alloy::primitives::U256;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    const HASH: &str = "0x88df016429689c079f3b2f6ad39fa052532c56795b733da78a91ebe6a713944b";

    /// Status source that reports one fixed state forever
    struct FixedStatus(RelayState);

    #[async_trait]
    impl RelayStatusSource for FixedStatus {
        async fn transaction_status(&self, id: &str) -> Result<RelayTransaction> {
            Ok(RelayTransaction {
                id: id.to_string(),
                state: self.0.clone(),
                transaction_hash: Some(HASH.to_string()),
                error_msg: None,
            })
        }
    }

    /// Relay that applies operations to the mock chain when they "land"
    struct MockRelay {
        chain: Arc<MockChain>,
        policy: ApprovalPolicy,
        deployed: AtomicBool,
        outcome: std::sync::Mutex<RelayState>,
        deploys: AtomicUsize,
        executes: AtomicUsize,
        delay: Duration,
    }

    impl MockRelay {
        fn new(chain: Arc<MockChain>, policy: ApprovalPolicy) -> Arc<Self> {
            Arc::new(Self {
                chain,
                policy,
                deployed: AtomicBool::new(false),
                outcome: std::sync::Mutex::new(RelayState::Mined),
                deploys: AtomicUsize::new(0),
                executes: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn mutating_calls(&self) -> usize {
            self.deploys.load(Ordering::SeqCst) + self.executes.load(Ordering::SeqCst)
        }

        fn set_outcome(&self, state: RelayState) {
            *self.outcome.lock().unwrap() = state;
        }

        fn handle(&self) -> TxHandle {
            let state = self.outcome.lock().unwrap().clone();
            TxHandle::new(
                "relay-1".to_string(),
                Arc::new(FixedStatus(state)),
                Duration::from_millis(5),
                Duration::from_millis(50),
            )
        }

        fn landed(&self) -> bool {
            self.outcome.lock().unwrap().is_success()
        }
    }

    #[async_trait]
    impl RelayExecutor for MockRelay {
        async fn deploy(&self, _account: Address) -> Result<TxHandle> {
            self.deploys.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.landed() {
                self.deployed.store(true, Ordering::SeqCst);
            }
            Ok(self.handle())
        }

        async fn execute(&self, account: Address, _ops: Vec<SafeOperation>) -> Result<TxHandle> {
            self.executes.fetch_add(1, Ordering::SeqCst);
            if self.landed() {
                approve_all(&self.chain, &self.policy, account);
            }
            Ok(self.handle())
        }

        async fn is_deployed(&self, _account: Address) -> Result<bool> {
            Ok(self.deployed.load(Ordering::SeqCst))
        }
    }

    struct CountingApi {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialApi for CountingApi {
        async fn derive(&self, _proof: &SignerProof) -> Result<Credential> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::CredentialApi("not found".to_string()))
        }

        async fn create(&self, _proof: &SignerProof) -> Result<Credential> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Credential {
                api_key: "key".to_string(),
                secret: "c2VjcmV0".to_string(),
                passphrase: "pass".to_string(),
            })
        }
    }

    fn approve_all(chain: &MockChain, policy: &ApprovalPolicy, account: Address) {
        for spender in &policy.erc20_spenders {
            chain.set_allowance(policy.token, account, *spender, U256::MAX);
        }
        for operator in &policy.operator_spenders {
            chain.set_operator(policy.position_token, account, *operator, true);
        }
    }

    struct Harness {
        chain: Arc<MockChain>,
        relay: Arc<MockRelay>,
        api: Arc<CountingApi>,
        store: Arc<MemoryCredentialStore>,
        policy: ApprovalPolicy,
    }

    impl Harness {
        fn new() -> Self {
            let chain = Arc::new(MockChain::new(137));
            let policy =
                ApprovalPolicy::from_config(&TokenConfig::default(), &ApprovalConfig::default())
                    .unwrap();
            Self {
                relay: MockRelay::new(chain.clone(), policy.clone()),
                chain,
                api: Arc::new(CountingApi {
                    calls: AtomicUsize::new(0),
                }),
                store: Arc::new(MemoryCredentialStore::new()),
                policy,
            }
        }

        fn manager_with(&self, signer: Arc<dyn OwnerSigner>, relay: Arc<dyn RelayExecutor>) -> SessionManager {
            let config = Config::default();
            SessionManager::new(
                SessionSettings {
                    chain_id: 137,
                    factory: FactoryParams::from_config(&config.factory).unwrap(),
                    api_url: "https://api.example.com".to_string(),
                },
                signer,
                relay,
                ApprovalChecker::new(self.chain.clone(), self.policy.clone()),
                CredentialIssuer::new(self.api.clone(), 137, 0),
                self.store.clone(),
            )
        }

        fn manager(&self) -> SessionManager {
            let signer = Arc::new(LocalKeySigner::from_hex(DEV_KEY, 137).unwrap());
            self.manager_with(signer, self.relay.clone())
        }
    }

    #[tokio::test]
    async fn test_fresh_account_runs_every_step() {
        let h = Harness::new();
        let manager = h.manager();

        let state = manager.init().await;
        assert!(state.is_complete(), "state: {}", state);
        assert_eq!(h.relay.deploys.load(Ordering::SeqCst), 1);
        assert_eq!(h.relay.executes.load(Ordering::SeqCst), 1);

        let session = manager.session().unwrap();
        assert_eq!(session.account_address, manager.account_address());
        assert_eq!(session.execution_client.funder(), manager.account_address());
        assert_eq!(h.store.get(manager.owner()).unwrap(), Some(session.credential.clone()));
    }

    #[tokio::test]
    async fn test_reinit_performs_no_mutating_calls() {
        let h = Harness::new();
        assert!(h.manager().init().await.is_complete());
        let mutating = h.relay.mutating_calls();
        let api_calls = h.api.calls.load(Ordering::SeqCst);

        // Fresh manager, as after a restart: deployed, approved, credential cached
        let manager = h.manager();
        assert!(manager.init().await.is_complete());
        assert!(manager.init().await.is_complete());

        assert_eq!(h.relay.mutating_calls(), mutating);
        assert_eq!(h.api.calls.load(Ordering::SeqCst), api_calls);
    }

    #[tokio::test]
    async fn test_already_deployed_skips_deploy() {
        let h = Harness::new();
        h.relay.deployed.store(true, Ordering::SeqCst);
        let manager = h.manager();
        approve_all(&h.chain, &h.policy, manager.account_address());

        assert!(manager.init().await.is_complete());
        assert_eq!(h.relay.mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_wrong_network_requests_switch() {
        let h = Harness::new();
        let signer = Arc::new(LocalKeySigner::from_hex(DEV_KEY, 1).unwrap());
        let manager = h.manager_with(signer.clone(), h.relay.clone());

        let state = manager.init().await;
        assert_eq!(state.error().unwrap().kind, ErrorKind::WrongNetwork);
        assert_eq!(h.relay.mutating_calls(), 0);
        assert_eq!(signer.chain_id().await.unwrap(), 137);

        // After the switch the next attempt succeeds
        assert!(manager.init().await.is_complete());
    }

    #[tokio::test]
    async fn test_revert_returns_to_idle_and_recovers() {
        let h = Harness::new();
        h.relay.deployed.store(true, Ordering::SeqCst);
        h.relay.set_outcome(RelayState::Failed);
        let manager = h.manager();

        let state = manager.init().await;
        assert_eq!(state.error().unwrap().kind, ErrorKind::OnChainRevert);
        assert!(h.store.get(manager.owner()).unwrap().is_none());

        h.relay.set_outcome(RelayState::Mined);
        assert!(manager.init().await.is_complete());
    }

    #[tokio::test]
    async fn test_confirmation_timeout_is_network_error() {
        let h = Harness::new();
        h.relay.set_outcome(RelayState::Executed);
        let manager = h.manager();

        let state = manager.init().await;
        let error = state.error().unwrap();
        assert_eq!(error.kind, ErrorKind::NetworkError);
        assert!(!manager.state().is_complete());
    }

    #[tokio::test]
    async fn test_approval_read_failure_does_not_reapprove() {
        let h = Harness::new();
        h.relay.deployed.store(true, Ordering::SeqCst);
        h.chain.fail_calls(true);
        let manager = h.manager();

        let state = manager.init().await;
        assert_eq!(state.error().unwrap().kind, ErrorKind::NetworkError);
        assert_eq!(h.relay.executes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_init_deploys_once() {
        let h = Harness::new();
        let relay = Arc::new(MockRelay {
            chain: h.chain.clone(),
            policy: h.policy.clone(),
            deployed: AtomicBool::new(false),
            outcome: std::sync::Mutex::new(RelayState::Mined),
            deploys: AtomicUsize::new(0),
            executes: AtomicUsize::new(0),
            delay: Duration::from_millis(30),
        });
        let signer = Arc::new(LocalKeySigner::from_hex(DEV_KEY, 137).unwrap());
        let manager = h.manager_with(signer, relay.clone());

        let (first, second) = tokio::join!(manager.init(), manager.init());
        assert!(first.is_complete() || second.is_complete());
        assert_eq!(relay.deploys.load(Ordering::SeqCst), 1);
        assert!(manager.state().is_complete());
    }

    #[tokio::test]
    async fn test_declined_signature_returns_to_idle() {
        let h = Harness::new();
        h.relay.deployed.store(true, Ordering::SeqCst);
        let signer = Arc::new(DecliningSigner::new(137));
        let manager = h.manager_with(signer.clone(), h.relay.clone());
        approve_all(&h.chain, &h.policy, manager.account_address());

        let state = manager.init().await;
        assert_eq!(state.name(), "idle");
        assert_eq!(state.error().unwrap().kind, ErrorKind::SignatureRejected);
        assert_eq!(signer.prompts(), 1);
        assert_eq!(h.api.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.relay.mutating_calls(), 0);
        assert!(h.store.get(manager.owner()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manager_signs_through_the_given_signer() {
        let h = Harness::new();
        let signer: Arc<dyn OwnerSigner> =
            SerializedSigner::new(Arc::new(LocalKeySigner::from_hex(DEV_KEY, 137).unwrap()));
        let manager = h.manager_with(signer.clone(), h.relay.clone());
        assert!(Arc::ptr_eq(&manager.signer, &signer));
    }

    #[tokio::test]
    async fn test_subscribers_see_final_state() {
        let h = Harness::new();
        let manager = h.manager();
        let rx = manager.subscribe();

        manager.init().await;
        assert!(rx.borrow().is_complete());
    }

    #[tokio::test]
    async fn test_logout_clears_credential() {
        let h = Harness::new();
        let manager = h.manager();
        assert!(manager.init().await.is_complete());

        manager.logout().await.unwrap();
        assert!(h.store.get(manager.owner()).unwrap().is_none());
        assert_eq!(manager.state().name(), "idle");
        assert!(manager.state().error().is_none());

        // Next init re-issues the credential
        let before = h.api.calls.load(Ordering::SeqCst);
        assert!(manager.init().await.is_complete());
        assert!(h.api.calls.load(Ordering::SeqCst) > before);
    }
}
