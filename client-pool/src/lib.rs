//! # Client Pool - Resilient Access to Redundant Chain Indexers
//!
//! This crate keeps a wallet connected to a set of redundant Blockbook-style
//! indexer endpoints. Exactly one endpoint is in use at a time; failing
//! endpoints are put in exponential-backoff cooldown and the pool rotates to
//! the next healthy one without surfacing the failure to callers.
//!
//! ## Modules
//!
//! - [`blockbook`] - HTTP + WebSocket client for a single Blockbook endpoint
//! - [`config`] - Pool, client, health and proxy configuration
//! - [`error`] - Typed error handling with thiserror
//! - [`health`] - Per-endpoint failure and backoff bookkeeping
//! - [`mock`] - In-memory client for tests
//! - [`model`] - Chain data types
//! - [`pool`] - The client pool
//! - [`rotation`] - Endpoint selection and connection lifecycle
//! - [`traits`] - Core trait definitions

pub mod blockbook;
pub mod config;
pub mod error;
pub mod health;
pub mod mock;
pub mod model;
pub mod pool;
pub mod rotation;
pub mod traits;
pub(crate) mod utils;

// Selective exports - only public API types
pub use blockbook::BlockbookClient;
pub use config::{ClientConfig, HealthConfig, PoolConfig, ProxyConfig};
pub use error::{ClientError, ConfigError, PoolError};
pub use health::HealthState;
pub use mock::{MockApiClient, MockFailure};
pub use model::{Address, Block, Info, Input, Output, Transaction, Utxo};
pub use pool::ClientPool;
pub use rotation::{CurrentClient, RotationManager, RotationStatus, Selection, SessionId};
pub use traits::{ApiClient, ChainApi};

pub use utils::setup_logger;
