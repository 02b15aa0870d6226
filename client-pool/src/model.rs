//! Chain data returned by indexers.
//!
//! Amounts are integer satoshis. These types are what both a single
//! endpoint client and the pool hand back to wallets.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An encoded wallet address as understood by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Backend status summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub coin: String,
    pub chain: String,
    pub version: String,
    pub protocol_version: String,
    pub blocks: u64,
    pub best_block_hash: String,
    pub difficulty: f64,
    pub testnet: bool,
    pub in_sync: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    pub height: u64,
    pub previous_block_hash: String,
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub txid: String,
    pub vout: u32,
    pub sequence: u32,
    pub n: u32,
    pub script_sig: String,
    pub addresses: Vec<String>,
    pub value: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub n: u32,
    pub script_pub_key: String,
    pub addresses: Vec<String>,
    pub value: u64,
    pub spent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    pub version: u32,
    pub lock_time: u32,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub block_hash: String,
    /// Zero or negative while unconfirmed.
    pub block_height: i64,
    pub block_time: i64,
    pub confirmations: u64,
    #[serde(with = "hex_bytes")]
    pub raw_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub address: String,
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub height: i64,
    pub confirmations: u64,
    pub script_pub_key: String,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
