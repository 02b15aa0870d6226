//! Blockbook v2 JSON shapes and their conversion into [`crate::model`] types.
//!
//! Blockbook is inconsistent about numeric encoding: amounts and versions
//! arrive as JSON strings on some coins and as numbers on others.

use crate::model::{Block, Info, Input, Output, Transaction, Utxo};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Satoshi amount encoded as a string or a number.
pub(crate) fn sats<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
            .ok_or_else(|| D::Error::custom(format!("invalid amount: {}", n))),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|e| D::Error::custom(format!("invalid amount '{}': {}", s, e))),
        other => Err(D::Error::custom(format!("unexpected amount: {}", other))),
    }
}

/// Float encoded as a string or a number.
pub(crate) fn float<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0.0),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| D::Error::custom(format!("invalid number: {}", n))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| D::Error::custom(format!("invalid number '{}': {}", s, e))),
        other => Err(D::Error::custom(format!("unexpected number: {}", other))),
    }
}

/// Any scalar rendered as text.
pub(crate) fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(D::Error::custom(format!("unexpected value: {}", other))),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BlockbookStatus {
    #[serde(default)]
    pub coin: String,
    #[serde(default)]
    pub in_sync: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BackendStatus {
    #[serde(default)]
    pub chain: String,
    pub blocks: u64,
    pub best_block_hash: String,
    #[serde(default, deserialize_with = "float")]
    pub difficulty: f64,
    #[serde(default, deserialize_with = "text")]
    pub version: String,
    #[serde(default, deserialize_with = "text")]
    pub protocol_version: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IndexResponse {
    #[serde(default)]
    pub blockbook: BlockbookStatus,
    pub backend: BackendStatus,
}

impl IndexResponse {
    pub fn into_info(self) -> Info {
        Info {
            coin: self.blockbook.coin,
            testnet: self.backend.chain != "main",
            chain: self.backend.chain,
            version: self.backend.version,
            protocol_version: self.backend.protocol_version,
            blocks: self.backend.blocks,
            best_block_hash: self.backend.best_block_hash,
            difficulty: self.backend.difficulty,
            in_sync: self.blockbook.in_sync,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VinResponse {
    #[serde(default)]
    pub txid: String,
    #[serde(default)]
    pub vout: u32,
    #[serde(default)]
    pub sequence: u32,
    #[serde(default)]
    pub n: u32,
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
    #[serde(default, deserialize_with = "sats")]
    pub value: u64,
    #[serde(default)]
    pub hex: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VoutResponse {
    #[serde(default, deserialize_with = "sats")]
    pub value: u64,
    #[serde(default)]
    pub n: u32,
    #[serde(default)]
    pub spent: bool,
    #[serde(default)]
    pub hex: String,
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TxResponse {
    pub txid: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub lock_time: u32,
    #[serde(default)]
    pub vin: Vec<VinResponse>,
    #[serde(default)]
    pub vout: Vec<VoutResponse>,
    #[serde(default)]
    pub block_hash: String,
    #[serde(default)]
    pub block_height: i64,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub block_time: i64,
    #[serde(default)]
    pub hex: String,
}

impl TxResponse {
    pub fn into_transaction(self) -> Result<Transaction, String> {
        let raw_bytes =
            hex::decode(&self.hex).map_err(|e| format!("invalid hex for {}: {}", self.txid, e))?;

        Ok(Transaction {
            txid: self.txid,
            version: self.version,
            lock_time: self.lock_time,
            inputs: self
                .vin
                .into_iter()
                .map(|vin| Input {
                    txid: vin.txid,
                    vout: vin.vout,
                    sequence: vin.sequence,
                    n: vin.n,
                    script_sig: vin.hex,
                    addresses: vin.addresses.unwrap_or_default(),
                    value: vin.value,
                })
                .collect(),
            outputs: self
                .vout
                .into_iter()
                .map(|vout| Output {
                    n: vout.n,
                    script_pub_key: vout.hex,
                    addresses: vout.addresses.unwrap_or_default(),
                    value: vout.value,
                    spent: vout.spent,
                })
                .collect(),
            block_hash: self.block_hash,
            block_height: self.block_height,
            block_time: self.block_time,
            confirmations: self.confirmations,
            raw_bytes,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AddressResponse {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub txids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UtxoResponse {
    pub txid: String,
    pub vout: u32,
    #[serde(default, deserialize_with = "sats")]
    pub value: u64,
    #[serde(default)]
    pub height: i64,
    #[serde(default)]
    pub confirmations: u64,
}

impl UtxoResponse {
    /// Fills in script and address from the funding transaction's output.
    pub fn into_utxo(self, fallback_address: &str, funding: &Transaction) -> Result<Utxo, String> {
        let output = funding
            .outputs
            .iter()
            .find(|o| o.n == self.vout)
            .ok_or_else(|| format!("transaction {} has no output {}", self.txid, self.vout))?;

        Ok(Utxo {
            address: output
                .addresses
                .first()
                .cloned()
                .unwrap_or_else(|| fallback_address.to_string()),
            txid: self.txid,
            vout: self.vout,
            value: self.value,
            height: self.height,
            confirmations: self.confirmations,
            script_pub_key: output.script_pub_key.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct SendTxResponse {
    #[serde(alias = "txid")]
    pub result: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BlockIndexResponse {
    pub block_hash: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FeeResponse {
    #[serde(deserialize_with = "float")]
    pub result: f64,
}

impl FeeResponse {
    /// Converts the BTC/kB estimate to satoshis per byte. Blockbook reports
    /// a negative rate when it has no estimate.
    pub fn sats_per_byte(&self) -> Option<u64> {
        if !self.result.is_finite() || self.result < 0.0 {
            return None;
        }
        Some((self.result * 1e8 / 1000.0).round() as u64)
    }
}

pub(crate) fn best_block(index: &IndexResponse, previous_block_hash: String) -> Block {
    Block {
        hash: index.backend.best_block_hash.clone(),
        height: index.backend.blocks,
        previous_block_hash,
        time: 0,
    }
}
