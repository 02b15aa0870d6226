//! # Blockbook Client
//!
//! [`ApiClient`] for one Blockbook indexer endpoint.
//!
//! Queries go over HTTP (`reqwest`) relative to the endpoint's base URL.
//! Notifications come from the endpoint's websocket (`tokio-tungstenite`)
//! at `{ws,wss}://host:port/websocket`, or from a best-block poller when an
//! outbound proxy is configured.
//!
//! The client is long-lived: the pool starts it when its endpoint is
//! selected and closes it on rotation, possibly many times.

mod http;
mod socket;
mod wire;

use crate::config::{validate_endpoint_url, ClientConfig, ProxyConfig};
use crate::error::{ClientError, ConfigError};
use crate::model::{Address, Block, Info, Transaction, Utxo};
use crate::traits::{ApiClient, ChainApi};
use async_trait::async_trait;
use self::http::HttpApi;
use self::socket::Publisher;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

struct Connection {
    cancel: CancellationToken,
    /// Outbound websocket frames. `None` when polling.
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

#[derive(Default)]
struct SocketState {
    addresses: Vec<String>,
    connection: Option<Connection>,
}

pub struct BlockbookClient {
    http: HttpApi,
    ws_url: Url,
    config: ClientConfig,
    proxied: bool,
    blocks: broadcast::Sender<Block>,
    txs: broadcast::Sender<Transaction>,
    socket: Mutex<SocketState>,
}

impl BlockbookClient {
    /// `endpoint` is the API base, e.g. `https://btc.example.com/api`.
    pub fn new(
        endpoint: &str,
        config: &ClientConfig,
        proxy: Option<&ProxyConfig>,
        notification_buffer: usize,
    ) -> Result<Self, ConfigError> {
        let mut base = validate_endpoint_url(endpoint)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let ws_url = websocket_url(&base)?;
        let http = HttpApi::new(base, endpoint, config, proxy)?;

        let (blocks, _) = broadcast::channel(notification_buffer.max(1));
        let (txs, _) = broadcast::channel(notification_buffer.max(1));

        Ok(Self {
            http,
            ws_url,
            config: *config,
            proxied: proxy.is_some(),
            blocks,
            txs,
            socket: Mutex::new(SocketState::default()),
        })
    }

    pub fn websocket_url(&self) -> &str {
        self.ws_url.as_str()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connection.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, SocketState> {
        self.socket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publisher(&self) -> Publisher {
        Publisher {
            http: self.http.clone(),
            blocks: self.blocks.clone(),
            txs: self.txs.clone(),
        }
    }

    /// Drops any previous connection and installs `connection`, subscribing
    /// to every queued address.
    fn install(&self, connection: Connection) {
        let mut state = self.lock();
        if let Some(outbound) = &connection.outbound {
            let _ = outbound.send(socket::block_subscription());
            if !state.addresses.is_empty() {
                let _ = outbound.send(socket::address_subscription(&state.addresses));
            }
        }
        if let Some(previous) = state.connection.replace(connection) {
            previous.cancel.cancel();
        }
    }

    async fn start_socket(&self, done: oneshot::Sender<ClientError>) -> Result<(), ClientError> {
        let stream = socket::connect(
            self.ws_url.as_str(),
            self.http.endpoint(),
            self.config.connect_timeout(),
        )
        .await?;

        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        self.install(Connection {
            cancel: cancel.clone(),
            outbound: Some(outbound),
        });
        tokio::spawn(socket::run_socket(
            stream,
            outbound_rx,
            self.publisher(),
            cancel,
            done,
        ));
        Ok(())
    }

    async fn start_poller(&self, done: oneshot::Sender<ClientError>) -> Result<(), ClientError> {
        let tip = self.http.best_block().await?;
        info!(
            endpoint = %self.http.endpoint(),
            height = tip.height,
            "Proxy configured, polling for new blocks"
        );

        let cancel = CancellationToken::new();
        self.install(Connection {
            cancel: cancel.clone(),
            outbound: None,
        });
        tokio::spawn(socket::run_poller(
            self.publisher(),
            tip.hash,
            self.config.poll_interval(),
            cancel,
            done,
        ));
        Ok(())
    }
}

impl Drop for BlockbookClient {
    fn drop(&mut self) {
        if let Some(connection) = self.lock().connection.take() {
            connection.cancel.cancel();
        }
    }
}

/// `http(s)://host:port/...` to `ws(s)://host:port/websocket`.
fn websocket_url(base: &Url) -> Result<Url, ConfigError> {
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    let host = base.host_str().ok_or_else(|| ConfigError::InvalidEndpointUrl {
        url: base.to_string(),
        reason: "missing host".to_string(),
    })?;
    let raw = match base.port() {
        Some(port) => format!("{}://{}:{}/websocket", scheme, host, port),
        None => format!("{}://{}/websocket", scheme, host),
    };
    Url::parse(&raw).map_err(|e| ConfigError::InvalidEndpointUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl ChainApi for BlockbookClient {
    type Error = ClientError;

    async fn get_info(&self) -> Result<Info, ClientError> {
        self.http.info().await
    }

    async fn get_transaction(&self, txid: &str) -> Result<Transaction, ClientError> {
        self.http.transaction(txid).await
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, ClientError> {
        Ok(self.http.transaction(txid).await?.raw_bytes)
    }

    async fn get_transactions(&self, addrs: &[Address]) -> Result<Vec<Transaction>, ClientError> {
        self.http.transactions(addrs).await
    }

    async fn get_utxos(&self, addrs: &[Address]) -> Result<Vec<Utxo>, ClientError> {
        self.http.utxos(addrs).await
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, ClientError> {
        self.http.broadcast(raw_tx).await
    }

    async fn estimate_fee(&self, blocks: u32) -> Result<u64, ClientError> {
        self.http.estimate_fee(blocks).await
    }

    async fn get_best_block(&self) -> Result<Block, ClientError> {
        self.http.best_block().await
    }

    /// Queues `addr` and, while connected, re-sends the address
    /// subscription. Polling connections only track new blocks.
    async fn listen_address(&self, addr: &Address) {
        let mut state = self.lock();
        if state.addresses.iter().any(|a| a == addr.as_str()) {
            return;
        }
        state.addresses.push(addr.to_string());

        let outbound = state
            .connection
            .as_ref()
            .and_then(|connection| connection.outbound.as_ref());
        if let Some(outbound) = outbound {
            let _ = outbound.send(socket::address_subscription(&state.addresses));
            debug!(endpoint = %self.http.endpoint(), %addr, "Subscribed address");
        }
    }

    fn block_notify(&self) -> broadcast::Receiver<Block> {
        self.blocks.subscribe()
    }

    fn transaction_notify(&self) -> broadcast::Receiver<Transaction> {
        self.txs.subscribe()
    }

    async fn close(&self) {
        if let Some(connection) = self.lock().connection.take() {
            connection.cancel.cancel();
            debug!(endpoint = %self.http.endpoint(), "Closed connection");
        }
    }
}

#[async_trait]
impl ApiClient for BlockbookClient {
    fn endpoint(&self) -> &str {
        self.http.endpoint()
    }

    async fn start(&self, done: oneshot::Sender<ClientError>) -> Result<(), ClientError> {
        if self.proxied {
            self.start_poller(done).await
        } else {
            self.start_socket(done).await
        }
    }
}
