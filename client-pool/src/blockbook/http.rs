use super::wire::{
    self, AddressResponse, BlockIndexResponse, FeeResponse, IndexResponse, SendTxResponse,
    TxResponse, UtxoResponse,
};
use crate::config::{ClientConfig, ProxyConfig};
use crate::error::{ClientError, ConfigError};
use crate::model::{Address, Block, Info, Transaction, Utxo};
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// Requests a single lookup may have in flight against one endpoint.
pub(crate) const MAX_CONCURRENT_REQUESTS: usize = 8;

/// Plain HTTP access to one Blockbook endpoint. Cheap to clone.
#[derive(Clone)]
pub(crate) struct HttpApi {
    base: Url,
    http: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpApi {
    pub fn new(
        base: Url,
        endpoint: &str,
        config: &ClientConfig,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Client::builder().timeout(config.request_timeout());

        if let Some(proxy_conf) = proxy {
            let mut proxy = reqwest::Proxy::all(&proxy_conf.url).map_err(|e| {
                ConfigError::InvalidValue {
                    field: "proxy".to_string(),
                    reason: e.to_string(),
                }
            })?;
            if let (Some(u), Some(p)) = (&proxy_conf.username, &proxy_conf.password) {
                proxy = proxy.basic_auth(u, p);
            }
            builder = builder.proxy(proxy);
        }

        let http = builder.build().map_err(|e| ConfigError::InvalidValue {
            field: "client".to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            base,
            http,
            endpoint: endpoint.to_string(),
            timeout: config.request_timeout(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path)
            .map_err(|e| self.invalid(format!("bad path '{}': {}", path, e)))
    }

    fn invalid(&self, reason: impl Into<String>) -> ClientError {
        ClientError::InvalidResponse {
            endpoint: self.endpoint.clone(),
            reason: reason.into(),
        }
    }

    fn transport(&self, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
                endpoint: self.endpoint.clone(),
            }
        } else {
            ClientError::Transport {
                endpoint: self.endpoint.clone(),
                reason: err.to_string(),
            }
        }
    }

    /// GETs `path` and decodes the JSON body. A 400 is retried once; any
    /// other non-success status is an error.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let url = self.url(path)?;
        let mut response = self
            .http
            .get(url.clone())
            .query(query)
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if response.status() == StatusCode::BAD_REQUEST {
            debug!(endpoint = %self.endpoint, %url, "Bad request, retrying once");
            response = self
                .http
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(|e| self.transport(e))?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::HttpStatus {
                status_code: status.as_u16(),
                endpoint: self.endpoint.clone(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| if e.is_timeout() { self.transport(e) } else { self.invalid(e.to_string()) })
    }

    async fn index(&self) -> Result<IndexResponse, ClientError> {
        self.get_json("", &[]).await
    }

    pub async fn info(&self) -> Result<Info, ClientError> {
        Ok(self.index().await?.into_info())
    }

    pub async fn transaction(&self, txid: &str) -> Result<Transaction, ClientError> {
        let tx: TxResponse = self.get_json(&format!("v2/tx/{}", txid), &[]).await?;
        tx.into_transaction().map_err(|reason| self.invalid(reason))
    }

    /// Every txid touching `addr`, across all pages.
    async fn address_txids(&self, addr: &Address) -> Result<Vec<String>, ClientError> {
        let path = format!("v2/address/{}", addr);
        let mut txids = Vec::new();
        let mut page = 1u32;

        loop {
            let res: AddressResponse = self
                .get_json(
                    &path,
                    &[("details", "txids".to_string()), ("page", page.to_string())],
                )
                .await?;
            txids.extend(res.txids.unwrap_or_default());
            if res.total_pages <= page {
                break;
            }
            page += 1;
        }

        Ok(txids)
    }

    pub async fn transactions(&self, addrs: &[Address]) -> Result<Vec<Transaction>, ClientError> {
        let per_address: Vec<Vec<String>> =
            stream::iter(addrs.iter().map(|addr| self.address_txids(addr)).collect::<Vec<_>>())
                .buffered(MAX_CONCURRENT_REQUESTS)
                .try_collect()
                .await?;

        let mut seen = HashSet::new();
        let txids: Vec<String> = per_address
            .into_iter()
            .flatten()
            .filter(|txid| seen.insert(txid.clone()))
            .collect();

        stream::iter(txids.iter().map(|txid| self.transaction(txid)).collect::<Vec<_>>())
            .buffered(MAX_CONCURRENT_REQUESTS)
            .try_collect()
            .await
    }

    async fn address_utxos(&self, addr: &Address) -> Result<Vec<UtxoResponse>, ClientError> {
        self.get_json(&format!("v2/utxo/{}", addr), &[]).await
    }

    /// Unspent outputs of `addrs`, each enriched from its funding transaction.
    pub async fn utxos(&self, addrs: &[Address]) -> Result<Vec<Utxo>, ClientError> {
        let per_address: Vec<Vec<UtxoResponse>> =
            stream::iter(addrs.iter().map(|addr| self.address_utxos(addr)).collect::<Vec<_>>())
                .buffered(MAX_CONCURRENT_REQUESTS)
                .try_collect()
                .await?;

        let pending = addrs
            .iter()
            .zip(per_address)
            .flat_map(|(addr, utxos)| utxos.into_iter().map(move |utxo| (addr, utxo)))
            .collect::<Vec<_>>();

        stream::iter(pending.into_iter().map(|(addr, utxo)| async move {
            let funding = self.transaction(&utxo.txid).await?;
            utxo.into_utxo(addr.as_str(), &funding)
                .map_err(|reason| self.invalid(reason))
        }).collect::<Vec<_>>())
        .buffered(MAX_CONCURRENT_REQUESTS)
        .try_collect()
        .await
    }

    pub async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, ClientError> {
        let res: SendTxResponse = self
            .get_json(&format!("v2/sendtx/{}", hex::encode(raw_tx)), &[])
            .await?;
        Ok(res.result)
    }

    pub async fn estimate_fee(&self, blocks: u32) -> Result<u64, ClientError> {
        let res: FeeResponse = self
            .get_json(&format!("v2/estimatefee/{}", blocks), &[])
            .await?;
        res.sats_per_byte()
            .ok_or_else(|| self.invalid(format!("no fee estimate for {} blocks", blocks)))
    }

    pub async fn best_block(&self) -> Result<Block, ClientError> {
        let index = self.index().await?;
        let previous = match index.backend.blocks.checked_sub(1) {
            Some(height) => {
                let res: BlockIndexResponse = self
                    .get_json(&format!("v2/block-index/{}", height), &[])
                    .await?;
                res.block_hash
            }
            None => String::new(),
        };
        Ok(wire::best_block(&index, previous))
    }
}
