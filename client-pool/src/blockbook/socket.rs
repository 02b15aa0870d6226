//! Notification transports for a Blockbook endpoint.
//!
//! The websocket task subscribes to new blocks and to the listened
//! addresses, resolves each notification into a full [`Block`] or
//! [`Transaction`] over HTTP, and publishes it. When a proxy is configured
//! the websocket cannot be tunnelled, so a poller watches the best block
//! over the proxied HTTP client instead.

use super::http::HttpApi;
use crate::error::ClientError;
use crate::model::{Block, Transaction};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const BLOCK_SUBSCRIPTION_ID: &str = "block";
const ADDRESS_SUBSCRIPTION_ID: &str = "addresses";

/// Consecutive polling failures after which the connection counts as lost.
pub(crate) const MAX_POLL_FAILURES: u32 = 3;

pub(crate) fn block_subscription() -> Message {
    let msg = json!({
        "id": BLOCK_SUBSCRIPTION_ID,
        "method": "subscribeNewBlock",
        "params": {}
    });
    Message::Text(msg.to_string().into())
}

/// Blockbook replaces the whole address set on each subscribe, so the full
/// list is always sent.
pub(crate) fn address_subscription(addresses: &[String]) -> Message {
    let msg = json!({
        "id": ADDRESS_SUBSCRIPTION_ID,
        "method": "subscribeAddresses",
        "params": { "addresses": addresses }
    });
    Message::Text(msg.to_string().into())
}

fn is_txid(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Where resolved notifications go.
#[derive(Clone)]
pub(crate) struct Publisher {
    pub http: HttpApi,
    pub blocks: broadcast::Sender<Block>,
    pub txs: broadcast::Sender<Transaction>,
}

impl Publisher {
    fn handle_text(&self, text: &str) {
        let Ok(msg) = serde_json::from_str::<Value>(text) else {
            warn!(endpoint = %self.http.endpoint(), "Unparseable websocket message");
            return;
        };
        let data = msg.get("data").cloned().unwrap_or(Value::Null);
        if data.get("subscribed").is_some() {
            debug!(endpoint = %self.http.endpoint(), id = ?msg.get("id"), "Subscription acknowledged");
            return;
        }

        match msg.get("id").and_then(Value::as_str) {
            Some(BLOCK_SUBSCRIPTION_ID) => self.spawn_block_fetch(),
            Some(ADDRESS_SUBSCRIPTION_ID) => {
                let txid = data
                    .pointer("/tx/txid")
                    .or_else(|| data.get("txid"))
                    .and_then(Value::as_str);
                match txid {
                    Some(txid) if is_txid(txid) => self.spawn_tx_fetch(txid.to_string()),
                    _ => debug!(endpoint = %self.http.endpoint(), "Address notification without txid"),
                }
            }
            other => debug!(endpoint = %self.http.endpoint(), id = ?other, "Ignoring websocket message"),
        }
    }

    fn spawn_block_fetch(&self) {
        let publisher = self.clone();
        tokio::spawn(async move {
            match publisher.http.best_block().await {
                Ok(block) => {
                    let _ = publisher.blocks.send(block);
                }
                Err(e) => error!(endpoint = %publisher.http.endpoint(), error = %e, "Error downloading best block"),
            }
        });
    }

    fn spawn_tx_fetch(&self, txid: String) {
        let publisher = self.clone();
        tokio::spawn(async move {
            match publisher.http.transaction(&txid).await {
                Ok(tx) => {
                    let _ = publisher.txs.send(tx);
                }
                Err(e) => error!(
                    endpoint = %publisher.http.endpoint(),
                    %txid,
                    error = %e,
                    "Error downloading tx after socket notification"
                ),
            }
        });
    }
}

/// Connects to `url`, failing after `timeout`.
pub(crate) async fn connect(url: &str, endpoint: &str, timeout: Duration) -> Result<WsStream, ClientError> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((stream, response))) => {
            info!(endpoint, status = response.status().as_u16(), "Connected to websocket endpoint");
            Ok(stream)
        }
        Ok(Err(e)) => Err(ClientError::WebSocket {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(ClientError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
            endpoint: endpoint.to_string(),
        }),
    }
}

/// Drives one websocket connection until it fails or is cancelled. The
/// terminal error is reported on `done`; cancellation drops `done` unsent.
pub(crate) async fn run_socket(
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    publisher: Publisher,
    cancel: CancellationToken,
    done: oneshot::Sender<ClientError>,
) {
    let endpoint = publisher.http.endpoint().to_string();
    let (mut write, mut read) = stream.split();

    let err = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = write.send(msg).await {
                        break ClientError::WebSocket { endpoint: endpoint.clone(), reason: e.to_string() };
                    }
                }
                None => return,
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => publisher.handle_text(&text),
                Some(Ok(Message::Close(_))) | None => {
                    break ClientError::Disconnected { endpoint: endpoint.clone() };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    break ClientError::WebSocket { endpoint: endpoint.clone(), reason: e.to_string() };
                }
            },
        }
    };

    warn!(endpoint = %err.endpoint(), error = %err, "Websocket connection lost");
    let _ = done.send(err);
}

/// Polls the best block every `interval`, publishing each new tip.
pub(crate) async fn run_poller(
    publisher: Publisher,
    mut last_hash: String,
    interval: Duration,
    cancel: CancellationToken,
    done: oneshot::Sender<ClientError>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately and the tip is already known.
    ticker.tick().await;
    let mut failures = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = publisher.http.best_block() => result,
        };

        match result {
            Ok(block) => {
                failures = 0;
                if block.hash != last_hash {
                    last_hash = block.hash.clone();
                    let _ = publisher.blocks.send(block);
                }
            }
            Err(e) => {
                failures += 1;
                warn!(
                    endpoint = %publisher.http.endpoint(),
                    failures,
                    error = %e,
                    "Best block poll failed"
                );
                if failures >= MAX_POLL_FAILURES {
                    let _ = done.send(e);
                    return;
                }
            }
        }
    }
}
