use crate::error::ClientError;
use crate::model::{Address, Block, Info, Transaction, Utxo};
use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

/// Query and notification surface shared by a single endpoint client and
/// the pool built on top of several of them.
///
/// Code written against `ChainApi` works unchanged whether it is handed one
/// backend or a [`crate::ClientPool`].
#[async_trait]
pub trait ChainApi: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get_info(&self) -> Result<Info, Self::Error>;

    async fn get_transaction(&self, txid: &str) -> Result<Transaction, Self::Error>;

    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, Self::Error>;

    /// All transactions touching any of `addrs`.
    async fn get_transactions(&self, addrs: &[Address]) -> Result<Vec<Transaction>, Self::Error>;

    async fn get_utxos(&self, addrs: &[Address]) -> Result<Vec<Utxo>, Self::Error>;

    /// Broadcasts a serialized transaction, returning its txid.
    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, Self::Error>;

    /// Fee rate in satoshis per byte for confirmation within `blocks`.
    async fn estimate_fee(&self, blocks: u32) -> Result<u64, Self::Error>;

    async fn get_best_block(&self) -> Result<Block, Self::Error>;

    /// Registers interest in transactions touching `addr`.
    async fn listen_address(&self, addr: &Address);

    /// New subscription to best-block notifications.
    fn block_notify(&self) -> broadcast::Receiver<Block>;

    /// New subscription to notifications for listened addresses.
    fn transaction_notify(&self) -> broadcast::Receiver<Transaction>;

    /// Releases all resources. Idempotent.
    async fn close(&self);
}

/// Connection to one backend endpoint.
///
/// A client is created once and started/closed repeatedly as the pool
/// rotates onto and away from its endpoint.
#[async_trait]
pub trait ApiClient: ChainApi<Error = ClientError> {
    /// Endpoint identifier this client talks to.
    fn endpoint(&self) -> &str;

    /// Begins connecting. Once connected, the terminal error is sent on
    /// `done` when the connection drops; if the client is closed instead,
    /// `done` is dropped unsent.
    async fn start(&self, done: oneshot::Sender<ClientError>) -> Result<(), ClientError>;
}
