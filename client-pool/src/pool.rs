//! # Client Pool
//!
//! A [`ChainApi`] implementation that spreads one logical backend across
//! several redundant endpoints.
//!
//! # Architecture
//!
//! 1. **Supervisor**: a background task keeps exactly one endpoint connected.
//!    It selects a healthy endpoint, starts its client, forwards the client's
//!    notifications into the pool's channels and replays every listened
//!    address. When the connection ends the endpoint is penalized and the loop
//!    selects again.
//! 2. **Requests**: every query runs through a bounded retry loop. A failed
//!    attempt marks the endpoint unhealthy and closes it, which forces the next
//!    attempt onto whichever endpoint is selected next.
//! 3. **Notifications**: the pool's block and transaction channels live as
//!    long as the pool. Receivers keep working across rotations.
//!
//! Callers only ever see [`PoolError::Exhausted`] when the whole retry budget
//! fails; individual endpoint errors become health updates.
//!
//! # Example
//!
//! ```rust,no_run
//! use client_pool::{ChainApi, ClientPool, PoolConfig};
//!
//! # async fn example() -> Result<(), client_pool::PoolError> {
//! let config = PoolConfig::new(
//!     "btc",
//!     vec![
//!         "https://btc1.example.com/api".to_string(),
//!         "https://btc2.example.com/api".to_string(),
//!     ],
//! );
//! let pool = ClientPool::new(&config)?;
//! pool.start()?;
//!
//! let tip = pool.get_best_block().await?;
//! println!("height {}", tip.height);
//!
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

use crate::blockbook::BlockbookClient;
use crate::config::PoolConfig;
use crate::error::{ClientError, ConfigError, PoolError};
use crate::model::{Address, Block, Info, Transaction, Utxo};
use crate::rotation::RotationManager;
use crate::traits::{ApiClient, ChainApi};
use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CLOSED: u8 = 2;

struct PoolInner {
    name: String,
    manager: Arc<RotationManager>,
    /// Addresses to replay onto every newly connected endpoint.
    listen_addrs: Mutex<Vec<Address>>,
    block_tx: broadcast::Sender<Block>,
    tx_tx: broadcast::Sender<Transaction>,
    /// Cancels the forwarder of the active connection.
    forwarder: std::sync::Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    max_attempts: u32,
    state: AtomicU8,
}

impl PoolInner {
    fn replace_forwarder(&self, token: Option<CancellationToken>) {
        let mut slot = self
            .forwarder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = std::mem::replace(&mut *slot, token) {
            previous.cancel();
        }
    }
}

pub struct ClientPool {
    inner: Arc<PoolInner>,
    run_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ClientPool {
    /// Builds a pool of Blockbook clients, one per configured endpoint.
    pub fn new(config: &PoolConfig) -> Result<Self, PoolError> {
        if config.endpoints.is_empty() {
            return Err(PoolError::NoEndpoints);
        }
        config.validate()?;

        let clients = config
            .endpoints
            .iter()
            .map(|endpoint| {
                BlockbookClient::new(
                    endpoint,
                    &config.client,
                    config.proxy.as_ref(),
                    config.notification_buffer,
                )
                .map(|client| Arc::new(client) as Arc<dyn ApiClient>)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::build(config, clients)
    }

    /// Builds a pool over pre-constructed clients, in priority order.
    /// `config.endpoints` is ignored.
    pub fn with_clients(
        config: &PoolConfig,
        clients: Vec<Arc<dyn ApiClient>>,
    ) -> Result<Self, PoolError> {
        if clients.is_empty() {
            return Err(PoolError::NoEndpoints);
        }
        config.validate_settings()?;

        let mut seen = HashSet::new();
        for client in &clients {
            if !seen.insert(client.endpoint().to_string()) {
                return Err(ConfigError::DuplicateEndpoint {
                    url: client.endpoint().to_string(),
                }
                .into());
            }
        }

        Self::build(config, clients)
    }

    fn build(config: &PoolConfig, clients: Vec<Arc<dyn ApiClient>>) -> Result<Self, PoolError> {
        let manager = RotationManager::new(clients, config.health)?;
        let (block_tx, _) = broadcast::channel(config.notification_buffer);
        let (tx_tx, _) = broadcast::channel(config.notification_buffer);

        let inner = PoolInner {
            name: config.name.clone(),
            manager: Arc::new(manager),
            listen_addrs: Mutex::new(Vec::new()),
            block_tx,
            tx_tx,
            forwarder: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
            max_attempts: config.max_attempts,
            state: AtomicU8::new(STATE_CREATED),
        };

        Ok(Self {
            inner: Arc::new(inner),
            run_handle: std::sync::Mutex::new(None),
        })
    }

    /// Launches the supervising loop and returns immediately.
    pub fn start(&self) -> Result<(), PoolError> {
        if let Err(state) = self.inner.state.compare_exchange(
            STATE_CREATED,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return Err(match state {
                STATE_CLOSED => PoolError::Closed,
                _ => PoolError::AlreadyStarted,
            });
        }

        info!(
            pool = %self.inner.name,
            endpoints = self.inner.manager.endpoints().len(),
            "Starting client pool"
        );
        let span = info_span!("pool", name = %self.inner.name);
        let handle = tokio::spawn(run(Arc::clone(&self.inner)).instrument(span));
        *self
            .run_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    pub fn manager(&self) -> &RotationManager {
        &self.inner.manager
    }

    /// Addresses replayed onto each new connection, in registration order.
    pub async fn listened_addresses(&self) -> Vec<Address> {
        self.inner.listen_addrs.lock().await.clone()
    }

    fn ensure_running(&self) -> Result<(), PoolError> {
        match self.inner.state.load(Ordering::SeqCst) {
            STATE_RUNNING => Ok(()),
            STATE_CREATED => Err(PoolError::NotStarted),
            _ => Err(PoolError::Closed),
        }
    }

    /// Runs `query` against the current endpoint, rotating on failure, up to
    /// the configured number of attempts.
    async fn execute_request<T, F, Fut>(
        &self,
        operation: &'static str,
        query: F,
    ) -> Result<T, PoolError>
    where
        F: Fn(Arc<dyn ApiClient>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ClientError>> + Send,
        T: Send,
    {
        self.ensure_running()?;
        let inner = &self.inner;

        for attempt in 1..=inner.max_attempts {
            let acquired = tokio::select! {
                _ = inner.shutdown.cancelled() => return Err(PoolError::Closed),
                acquired = inner.manager.acquire_current_when_ready() => acquired,
            };
            // The supervisor already penalized an endpoint that failed to start.
            let current = match acquired {
                Ok(current) => current,
                Err(err) => {
                    warn!(
                        operation,
                        endpoint = %err.endpoint(),
                        attempt,
                        max_attempts = inner.max_attempts,
                        error = %err,
                        "No usable endpoint for request"
                    );
                    continue;
                }
            };
            let session = current.session();

            match query(current.client()).await {
                Ok(value) => {
                    debug!(operation, endpoint = %current.endpoint(), attempt, "Request succeeded");
                    return Ok(value);
                }
                Err(err) => {
                    let endpoint = current.endpoint().to_string();
                    current.release();
                    warn!(
                        operation,
                        %endpoint,
                        attempt,
                        max_attempts = inner.max_attempts,
                        error = %err,
                        "Request failed, rotating endpoint"
                    );
                    inner.manager.fail_and_close(session).await;
                }
            }
        }

        error!(
            pool = %inner.name,
            operation,
            attempts = inner.max_attempts,
            "All attempts failed"
        );
        Err(PoolError::Exhausted {
            operation,
            attempts: inner.max_attempts,
        })
    }
}

impl Drop for ClientPool {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Supervising loop. Keeps one endpoint connected until shutdown.
async fn run(inner: Arc<PoolInner>) {
    let manager = Arc::clone(&inner.manager);

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        let selected = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            selection = manager.select_next() => selection,
        };

        // Subscribe before starting so nothing published on connect is missed.
        let mut blocks = selected.client.block_notify();
        let mut txs = selected.client.transaction_notify();

        let (done_tx, done_rx) = oneshot::channel();
        let started = match manager.start_current(done_tx).await {
            Ok(started) => started,
            Err(PoolError::Start { endpoint, source }) => {
                warn!(%endpoint, error = %source, "Failed to start client");
                manager.fail_and_close(selected.session).await;
                continue;
            }
            Err(err) => {
                debug!(error = %err, "Selection changed before start");
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = manager.wait_session_end(selected.session) => {}
                }
                continue;
            }
        };

        if started.session != selected.session {
            blocks = started.client.block_notify();
            txs = started.client.transaction_notify();
        }
        info!(endpoint = %started.endpoint, session = %started.session, "Connected");

        let cancel = CancellationToken::new();
        inner.replace_forwarder(Some(cancel.clone()));
        tokio::spawn(
            forward_notifications(
                blocks,
                txs,
                inner.block_tx.clone(),
                inner.tx_tx.clone(),
                cancel.clone(),
            )
            .in_current_span(),
        );

        {
            let addrs = inner.listen_addrs.lock().await;
            for addr in addrs.iter() {
                started.client.listen_address(addr).await;
            }
            if !addrs.is_empty() {
                debug!(count = addrs.len(), endpoint = %started.endpoint, "Replayed address subscriptions");
            }
        }

        let reason = tokio::select! {
            _ = inner.shutdown.cancelled() => {
                cancel.cancel();
                break;
            }
            done = done_rx => match done {
                Ok(err) => err.to_string(),
                Err(_) => "connection closed".to_string(),
            },
            _ = manager.wait_session_end(started.session) => "rotated away".to_string(),
        };

        warn!(endpoint = %started.endpoint, %reason, "Connection ended");
        manager.fail_and_close(started.session).await;
        cancel.cancel();
    }

    inner.replace_forwarder(None);
    manager.close_current().await;
    debug!("Supervisor stopped");
}

/// Copies one connection's notifications into the pool channels until
/// cancelled or the client's channels close.
async fn forward_notifications(
    mut blocks: broadcast::Receiver<Block>,
    mut txs: broadcast::Receiver<Transaction>,
    block_out: broadcast::Sender<Block>,
    tx_out: broadcast::Sender<Transaction>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            block = blocks.recv() => match block {
                // No receivers is fine; the pool keeps running.
                Ok(block) => { let _ = block_out.send(block); }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Block notifications lagged"),
                Err(RecvError::Closed) => break,
            },
            tx = txs.recv() => match tx {
                Ok(tx) => { let _ = tx_out.send(tx); }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Transaction notifications lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[async_trait]
impl ChainApi for ClientPool {
    type Error = PoolError;

    async fn get_info(&self) -> Result<Info, PoolError> {
        self.execute_request("get_info", |client| async move { client.get_info().await })
            .await
    }

    async fn get_transaction(&self, txid: &str) -> Result<Transaction, PoolError> {
        self.execute_request("get_transaction", move |client| async move {
            client.get_transaction(txid).await
        })
        .await
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, PoolError> {
        self.execute_request("get_raw_transaction", move |client| async move {
            client.get_raw_transaction(txid).await
        })
        .await
    }

    async fn get_transactions(&self, addrs: &[Address]) -> Result<Vec<Transaction>, PoolError> {
        self.execute_request("get_transactions", move |client| async move {
            client.get_transactions(addrs).await
        })
        .await
    }

    async fn get_utxos(&self, addrs: &[Address]) -> Result<Vec<Utxo>, PoolError> {
        self.execute_request("get_utxos", move |client| async move {
            client.get_utxos(addrs).await
        })
        .await
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, PoolError> {
        self.execute_request("broadcast", move |client| async move {
            client.broadcast(raw_tx).await
        })
        .await
    }

    async fn estimate_fee(&self, blocks: u32) -> Result<u64, PoolError> {
        self.execute_request("estimate_fee", move |client| async move {
            client.estimate_fee(blocks).await
        })
        .await
    }

    async fn get_best_block(&self) -> Result<Block, PoolError> {
        self.execute_request("get_best_block", |client| async move {
            client.get_best_block().await
        })
        .await
    }

    /// Registers `addr` for replay and forwards it to the current client.
    ///
    /// The registration never waits on the rotation lock. The forward does,
    /// so a pending health update cannot make a live connection miss the
    /// address. With nothing current the next connection's replay covers it.
    async fn listen_address(&self, addr: &Address) {
        {
            let mut addrs = self.inner.listen_addrs.lock().await;
            if addrs.contains(addr) {
                return;
            }
            addrs.push(addr.clone());
        }

        if let Ok(current) = self.inner.manager.acquire_current().await {
            debug!(%addr, endpoint = %current.endpoint(), "Forwarding address subscription");
            current.listen_address(addr).await;
        }
    }

    fn block_notify(&self) -> broadcast::Receiver<Block> {
        self.inner.block_tx.subscribe()
    }

    fn transaction_notify(&self) -> broadcast::Receiver<Transaction> {
        self.inner.tx_tx.subscribe()
    }

    /// Stops the supervisor and closes the current connection. The pool
    /// cannot be restarted.
    async fn close(&self) {
        if self.inner.state.swap(STATE_CLOSED, Ordering::SeqCst) == STATE_CLOSED {
            return;
        }
        info!(pool = %self.inner.name, "Closing client pool");

        self.inner.shutdown.cancel();
        self.inner.replace_forwarder(None);

        let handle = self
            .run_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Supervisor task ended abnormally");
            }
        }
        self.inner.manager.close_current().await;
    }
}
