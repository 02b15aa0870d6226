//! In-memory [`ApiClient`] for exercising the pool without a network.
//!
//! A `MockApiClient` serves canned chain data, can be scripted to fail
//! requests or its own start, records every address subscription it
//! receives, and lets tests push notifications or drop the connection the
//! way a real backend would.

use crate::error::ClientError;
use crate::model::{Address, Block, Info, Input, Output, Transaction, Utxo};
use crate::traits::{ApiClient, ChainApi};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

/// How a scripted request failure manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// Responds with this HTTP status.
    Status(u16),
    /// Hangs for the given duration, then reports a timeout.
    Timeout(Duration),
    /// Connection refused.
    Unreachable,
}

#[derive(Default)]
struct MockState {
    done: Option<oneshot::Sender<ClientError>>,
    started: bool,
    failure: Option<MockFailure>,
    /// Remaining scripted failures before `failure` is cleared; `None`
    /// keeps failing forever.
    failures_left: Option<usize>,
    fail_start: bool,
    info: Info,
    best_block: Block,
    fee: u64,
    transactions: HashMap<String, Transaction>,
    utxos: Vec<Utxo>,
    listened: Vec<Address>,
    broadcasts: Vec<Vec<u8>>,
}

pub struct MockApiClient {
    endpoint: String,
    blocks: broadcast::Sender<Block>,
    txs: broadcast::Sender<Transaction>,
    state: Mutex<MockState>,
    requests: AtomicUsize,
    starts: AtomicUsize,
    closes: AtomicUsize,
}

impl MockApiClient {
    pub fn new(endpoint: &str) -> Self {
        let (blocks, _) = broadcast::channel(64);
        let (txs, _) = broadcast::channel(64);
        let state = MockState {
            info: fixtures::info(),
            best_block: fixtures::block(1_000),
            fee: 10,
            ..Default::default()
        };

        Self {
            endpoint: endpoint.to_string(),
            blocks,
            txs,
            state: Mutex::new(state),
            requests: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    /// Every request fails with `failure` until cleared.
    pub fn fail_with(&self, failure: MockFailure) {
        let mut state = self.lock();
        state.failure = Some(failure);
        state.failures_left = None;
    }

    /// The next `count` requests fail with `failure`.
    pub fn fail_next(&self, count: usize, failure: MockFailure) {
        let mut state = self.lock();
        state.failure = Some(failure);
        state.failures_left = Some(count);
    }

    pub fn clear_failure(&self) {
        let mut state = self.lock();
        state.failure = None;
        state.failures_left = None;
    }

    pub fn fail_start(&self, fail: bool) {
        self.lock().fail_start = fail;
    }

    pub fn set_fee(&self, fee: u64) {
        self.lock().fee = fee;
    }

    pub fn insert_transaction(&self, tx: Transaction) {
        self.lock().transactions.insert(tx.txid.clone(), tx);
    }

    pub fn insert_utxo(&self, utxo: Utxo) {
        self.lock().utxos.push(utxo);
    }

    /// Publishes a new best block, as the backend would on a new tip.
    pub fn push_block(&self, block: Block) {
        self.lock().best_block = block.clone();
        let _ = self.blocks.send(block);
    }

    /// Publishes a transaction notification.
    pub fn push_transaction(&self, tx: Transaction) {
        self.insert_transaction(tx.clone());
        let _ = self.txs.send(tx);
    }

    /// Simulates the backend dropping the connection. Returns false if the
    /// client was not started.
    pub fn drop_connection(&self, err: ClientError) -> bool {
        let done = {
            let mut state = self.lock();
            state.started = false;
            state.done.take()
        };
        match done {
            Some(done) => done.send(err).is_ok(),
            None => false,
        }
    }

    /// Convenience for [`Self::drop_connection`] with a disconnect error.
    pub fn disconnect(&self) -> bool {
        self.drop_connection(ClientError::Disconnected {
            endpoint: self.endpoint.clone(),
        })
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Every `listen_address` call received, in order, duplicates included.
    pub fn listened_addresses(&self) -> Vec<Address> {
        self.lock().listened.clone()
    }

    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.lock().broadcasts.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Counts the request and applies any scripted failure.
    async fn request(&self) -> Result<(), ClientError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let failure = {
            let mut state = self.lock();
            let failure = state.failure.clone();
            if let Some(left) = state.failures_left.as_mut() {
                *left = left.saturating_sub(1);
                if *left == 0 {
                    state.failure = None;
                    state.failures_left = None;
                }
            }
            failure
        };

        match failure {
            None => Ok(()),
            Some(MockFailure::Status(status_code)) => Err(ClientError::HttpStatus {
                status_code,
                endpoint: self.endpoint.clone(),
            }),
            Some(MockFailure::Timeout(after)) => {
                tokio::time::sleep(after).await;
                Err(ClientError::Timeout {
                    timeout_ms: after.as_millis() as u64,
                    endpoint: self.endpoint.clone(),
                })
            }
            Some(MockFailure::Unreachable) => Err(ClientError::Transport {
                endpoint: self.endpoint.clone(),
                reason: "connection refused".to_string(),
            }),
        }
    }

    fn touches(tx: &Transaction, addrs: &[Address]) -> bool {
        let wanted = |list: &Vec<String>| list.iter().any(|a| addrs.iter().any(|w| w.as_str() == a));
        tx.inputs.iter().any(|i| wanted(&i.addresses)) || tx.outputs.iter().any(|o| wanted(&o.addresses))
    }
}

#[async_trait]
impl ChainApi for MockApiClient {
    type Error = ClientError;

    async fn get_info(&self) -> Result<Info, ClientError> {
        self.request().await?;
        Ok(self.lock().info.clone())
    }

    async fn get_transaction(&self, txid: &str) -> Result<Transaction, ClientError> {
        self.request().await?;
        let state = self.lock();
        Ok(state
            .transactions
            .get(txid)
            .cloned()
            .unwrap_or_else(|| fixtures::transaction(txid)))
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, ClientError> {
        let tx = self.get_transaction(txid).await?;
        Ok(tx.raw_bytes)
    }

    async fn get_transactions(&self, addrs: &[Address]) -> Result<Vec<Transaction>, ClientError> {
        self.request().await?;
        let state = self.lock();
        let mut txs: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| Self::touches(tx, addrs))
            .cloned()
            .collect();
        txs.sort_by(|a, b| a.txid.cmp(&b.txid));
        Ok(txs)
    }

    async fn get_utxos(&self, addrs: &[Address]) -> Result<Vec<Utxo>, ClientError> {
        self.request().await?;
        let state = self.lock();
        Ok(state
            .utxos
            .iter()
            .filter(|u| addrs.iter().any(|a| a.as_str() == u.address))
            .cloned()
            .collect())
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, ClientError> {
        self.request().await?;
        self.lock().broadcasts.push(raw_tx.to_vec());
        Ok(fixtures::txid_for(raw_tx))
    }

    async fn estimate_fee(&self, _blocks: u32) -> Result<u64, ClientError> {
        self.request().await?;
        Ok(self.lock().fee)
    }

    async fn get_best_block(&self) -> Result<Block, ClientError> {
        self.request().await?;
        Ok(self.lock().best_block.clone())
    }

    async fn listen_address(&self, addr: &Address) {
        self.lock().listened.push(addr.clone());
    }

    fn block_notify(&self) -> broadcast::Receiver<Block> {
        self.blocks.subscribe()
    }

    fn transaction_notify(&self) -> broadcast::Receiver<Transaction> {
        self.txs.subscribe()
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        state.started = false;
        // Dropping `done` unsent tells the supervisor the connection ended.
        state.done = None;
    }
}

#[async_trait]
impl ApiClient for MockApiClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn start(&self, done: oneshot::Sender<ClientError>) -> Result<(), ClientError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.fail_start {
            return Err(ClientError::WebSocket {
                endpoint: self.endpoint.clone(),
                reason: "handshake refused".to_string(),
            });
        }
        state.started = true;
        state.done = Some(done);
        Ok(())
    }
}

/// Canned chain data.
pub mod fixtures {
    use super::*;

    pub fn info() -> Info {
        Info {
            coin: "Bitcoin".to_string(),
            chain: "test".to_string(),
            version: "0.3.6".to_string(),
            protocol_version: "70015".to_string(),
            blocks: 1_000,
            best_block_hash: block_hash(1_000),
            difficulty: 1.0,
            testnet: true,
            in_sync: true,
        }
    }

    pub fn block_hash(height: u64) -> String {
        format!("{:064x}", height)
    }

    pub fn block(height: u64) -> Block {
        Block {
            hash: block_hash(height),
            height,
            previous_block_hash: block_hash(height.saturating_sub(1)),
            time: 1_600_000_000 + height as i64 * 600,
        }
    }

    pub fn transaction(txid: &str) -> Transaction {
        Transaction {
            txid: txid.to_string(),
            version: 2,
            lock_time: 0,
            inputs: vec![Input {
                txid: format!("{:064x}", 1),
                vout: 0,
                sequence: u32::MAX,
                n: 0,
                script_sig: String::new(),
                addresses: vec!["tb1qsender".to_string()],
                value: 150_000,
            }],
            outputs: vec![Output {
                n: 0,
                script_pub_key: "0014aa".to_string(),
                addresses: vec!["tb1qreceiver".to_string()],
                value: 100_000,
                spent: false,
            }],
            block_hash: block_hash(1_000),
            block_height: 1_000,
            block_time: 1_600_600_000,
            confirmations: 1,
            raw_bytes: txid.as_bytes().to_vec(),
        }
    }

    /// Deterministic stand-in for a txid derived from raw bytes.
    pub fn txid_for(raw_tx: &[u8]) -> String {
        let mut hex = hex::encode(raw_tx);
        hex.truncate(64);
        format!("{:0>64}", hex)
    }
}
