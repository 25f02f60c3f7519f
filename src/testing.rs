//! In-memory collaborators shared by unit tests

use alloy::primitives::{Address, Bytes, Signature, B256, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::chain::abi::{allowanceCall, isApprovedForAllCall, nonceCall, transfer_topic};
use crate::account::{LocalKeySigner, OwnerSigner};
use crate::chain::{ChainReader, Log, TransactionReceipt};
use crate::error::{Error, Result};

pub(crate) use crate::account::signer::tests::DEV_KEY;

fn word(value: U256) -> Bytes {
    Bytes::from(value.to_be_bytes::<32>().to_vec())
}

/// Chain reader answering from a table of canned `eth_call` results.
///
/// Unknown calls return a zero word, so allowances default to 0 and
/// operator flags to false.
pub(crate) struct MockChain {
    chain_id: u64,
    calls: Mutex<HashMap<(Address, Bytes), Bytes>>,
    receipts: Mutex<HashMap<B256, TransactionReceipt>>,
    fail: AtomicBool,
    call_count: AtomicUsize,
}

impl MockChain {
    pub(crate) fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            calls: Mutex::new(HashMap::new()),
            receipts: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
            call_count: AtomicUsize::new(0),
        }
    }

    fn set_call(&self, to: Address, data: Vec<u8>, ret: Bytes) {
        self.calls.lock().unwrap().insert((to, Bytes::from(data)), ret);
    }

    pub(crate) fn set_allowance(&self, token: Address, owner: Address, spender: Address, amount: U256) {
        let call = allowanceCall { owner, spender };
        self.set_call(token, call.abi_encode(), word(amount));
    }

    pub(crate) fn set_operator(&self, token: Address, account: Address, operator: Address, approved: bool) {
        let call = isApprovedForAllCall { account, operator };
        self.set_call(token, call.abi_encode(), word(U256::from(approved as u8)));
    }

    pub(crate) fn set_nonce(&self, account: Address, nonce: u64) {
        self.set_call(account, nonceCall {}.abi_encode(), word(U256::from(nonce)));
    }

    pub(crate) fn set_receipt(&self, receipt: TransactionReceipt) {
        self.receipts
            .lock()
            .unwrap()
            .insert(receipt.transaction_hash, receipt);
    }

    pub(crate) fn fail_calls(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Rpc("connection refused".to_string()));
        }
        Ok(self
            .calls
            .lock()
            .unwrap()
            .get(&(to, data))
            .cloned()
            .unwrap_or_else(|| word(U256::ZERO)))
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TransactionReceipt>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Rpc("connection refused".to_string()));
        }
        Ok(self.receipts.lock().unwrap().get(&tx_hash).cloned())
    }
}

/// ERC-20 `Transfer` log as the token contract would emit it
pub(crate) fn transfer_log(token: Address, from: Address, to: Address, raw: U256) -> Log {
    Log {
        address: token,
        topics: vec![transfer_topic(), from.into_word(), to.into_word()],
        data: word(raw),
    }
}

/// Receipt carrying the given logs
pub(crate) fn receipt(tx_hash: B256, success: bool, logs: Vec<Log>) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx_hash,
        success,
        logs,
    }
}

/// Owner that declines every signing prompt
pub(crate) struct DecliningSigner {
    inner: LocalKeySigner,
    prompts: AtomicUsize,
}

impl DecliningSigner {
    pub(crate) fn new(chain_id: u64) -> Self {
        Self {
            inner: LocalKeySigner::from_hex(DEV_KEY, chain_id).unwrap(),
            prompts: AtomicUsize::new(0),
        }
    }

    pub(crate) fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    fn decline(&self) -> Result<Signature> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        Err(Error::SignatureRejected("user denied signature".to_string()))
    }
}

#[async_trait]
impl OwnerSigner for DecliningSigner {
    fn address(&self) -> Address {
        self.inner.address()
    }

    async fn chain_id(&self) -> Result<u64> {
        self.inner.chain_id().await
    }

    async fn request_chain_switch(&self, chain_id: u64) -> Result<()> {
        self.inner.request_chain_switch(chain_id).await
    }

    async fn sign_hash(&self, _hash: B256) -> Result<Signature> {
        self.decline()
    }

    async fn sign_message(&self, _message: &[u8]) -> Result<Signature> {
        self.decline()
    }
}
