use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::chain_decoder::{
    decode_order_filled, parse_hex_u64, DecodedFill, RawLog, CTF_EXCHANGE, NEG_RISK_CTF_EXCHANGE,
    ORDER_FILLED_TOPIC,
};
use super::dedup::DedupStore;
use super::reorg::ReorgBuffer;
use crate::config::ChainConfig;
use crate::errors::{DecodeError, FeedError};
use crate::models::{CanonicalId, SignalSource, TradeSignal};
use crate::polymarket::MarketDataService;
use crate::services::health_monitor::Liveness;
use crate::services::parity_checker::ParityChecker;

const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(25);
const RELEASE_INTERVAL: Duration = Duration::from_secs(1);
/// Fills waiting this long for their transaction's gas price are emitted without it.
const GAS_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

const LOGS_SUB_ID: u64 = 1;
const BACKFILL_ID: u64 = 2;
const HEADS_SUB_ID: u64 = 3;
/// Request ids from here on are `eth_getTransactionByHash` lookups.
const GAS_LOOKUP_BASE_ID: u64 = 1_000;
/// Block heads remembered for timestamping fills. Well past any confirmation depth.
const BLOCK_CLOCK_CAPACITY: usize = 512;

/// Everything the chain worker needs, owned by its task.
pub struct ChainListener {
    pub config: ChainConfig,
    pub tracked: HashSet<String>,
    pub dedup: Arc<DedupStore>,
    pub market_data: Arc<dyn MarketDataService>,
    pub signal_tx: mpsc::Sender<TradeSignal>,
    pub liveness: Arc<Liveness>,
    pub parity: Arc<ParityChecker>,
}

/// State that survives reconnects.
struct ChainState {
    last_block: u64,
    reorg: ReorgBuffer<DecodedFill>,
    reported_drops: u64,
    next_request_id: u64,
    gas_lookups: HashMap<u64, PendingEmit>,
    clock: BlockClock,
}

/// A confirmed fill waiting on its transaction's gas price.
struct PendingEmit {
    fill: DecodedFill,
    block_time: Option<DateTime<Utc>>,
    requested: Instant,
}

// ---------------------------------------------------------------------------
// Block clock
// ---------------------------------------------------------------------------

/// Timestamps of recent blocks, from new heads and from logs that carry
/// `blockTimestamp`.
#[derive(Debug)]
pub struct BlockClock {
    times: BTreeMap<u64, DateTime<Utc>>,
    capacity: usize,
}

impl BlockClock {
    pub fn new(capacity: usize) -> Self {
        Self {
            times: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, block: u64, unix_secs: u64) {
        let Some(at) = i64::try_from(unix_secs).ok().and_then(|s| DateTime::from_timestamp(s, 0)) else {
            return;
        };
        self.times.insert(block, at);
        while self.times.len() > self.capacity {
            self.times.pop_first();
        }
    }

    pub fn time_of(&self, block: u64) -> Option<DateTime<Utc>> {
        self.times.get(&block).copied()
    }
}

/// When the whale traded: the block's time, never later than `now`.
pub fn whale_time(block_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    block_time.map_or(now, |t| t.min(now))
}

/// Run the Polygon chain listener: subscribe to `OrderFilled` logs on both CTF
/// Exchange contracts plus new block heads, hold fills until confirmed and
/// forward tracked-wallet fills as signals.
pub async fn run_chain_listener(listener: ChainListener, mut running: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    let mut state = ChainState {
        last_block: 0,
        reorg: ReorgBuffer::new(listener.config.confirmations, listener.config.max_pending),
        reported_drops: 0,
        next_request_id: GAS_LOOKUP_BASE_ID,
        gas_lookups: HashMap::new(),
        clock: BlockClock::new(BLOCK_CLOCK_CAPACITY),
    };

    tracing::info!(
        wallets = listener.tracked.len(),
        confirmations = listener.config.confirmations,
        "Chain listener starting"
    );

    while *running.borrow() {
        tracing::info!(url = %listener.config.ws_url, "Chain listener connecting to Polygon WSS...");

        match listener.run_session(&mut state, &mut attempt, &mut running).await {
            Ok(()) => {
                if !*running.borrow() {
                    break;
                }
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, "Chain listener session ended");
            }
            Err(e) => {
                tracing::error!(error = %e, "Chain listener stopped on non-retryable error");
                return;
            }
        }

        let delay = BASE_RECONNECT_DELAY * 2u32.saturating_pow(attempt);
        let delay = delay.min(MAX_RECONNECT_DELAY);
        attempt = attempt.saturating_add(1);
        tracing::info!(delay_secs = delay.as_secs(), attempt, "Chain listener reconnecting...");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = running.changed() => {}
        }
    }

    tracing::info!("Chain listener stopped");
}

impl ChainListener {
    async fn run_session(
        &self,
        state: &mut ChainState,
        attempt: &mut u32,
        running: &mut watch::Receiver<bool>,
    ) -> Result<(), FeedError> {
        let (ws_stream, _response) = connect_async(&self.config.ws_url).await?;
        tracing::info!("Chain listener connected to Polygon WSS");
        *attempt = 0;

        let (mut write, mut read) = ws_stream.split();

        let subscribe_logs = serde_json::json!({
            "jsonrpc": "2.0",
            "id": LOGS_SUB_ID,
            "method": "eth_subscribe",
            "params": ["logs", {
                "address": [CTF_EXCHANGE, NEG_RISK_CTF_EXCHANGE],
                "topics": [[ORDER_FILLED_TOPIC]]
            }]
        });
        let subscribe_heads = serde_json::json!({
            "jsonrpc": "2.0",
            "id": HEADS_SUB_ID,
            "method": "eth_subscribe",
            "params": ["newHeads"]
        });
        write.send(Message::Text(subscribe_logs.to_string().into())).await?;
        write.send(Message::Text(subscribe_heads.to_string().into())).await?;

        // Catch up on fills emitted while disconnected.
        if state.last_block > 0 {
            let from = state.last_block.saturating_sub(self.config.backfill_blocks);
            let backfill = serde_json::json!({
                "jsonrpc": "2.0",
                "id": BACKFILL_ID,
                "method": "eth_getLogs",
                "params": [{
                    "address": [CTF_EXCHANGE, NEG_RISK_CTF_EXCHANGE],
                    "topics": [[ORDER_FILLED_TOPIC]],
                    "fromBlock": format!("0x{from:x}"),
                    "toBlock": "latest"
                }]
            });
            write.send(Message::Text(backfill.to_string().into())).await?;
            tracing::info!(from_block = from, "Chain listener requested backfill");
        }

        let mut ping_timer = interval(PING_INTERVAL);
        ping_timer.tick().await;
        let mut release_timer = interval(RELEASE_INTERVAL);
        let mut heads_sub: Option<String> = None;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_rpc_message(text.as_ref(), state, &mut heads_sub)?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::warn!("Chain listener: server sent close frame");
                            return Err(FeedError::Closed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(FeedError::Closed),
                    }
                }
                _ = ping_timer.tick() => {
                    write.send(Message::Ping(vec![].into())).await?;
                }
                _ = release_timer.tick() => {
                    for req in self.release_confirmed(state) {
                        write.send(Message::Text(req.into())).await?;
                    }
                    self.flush_gas_timeouts(state);
                    if self.liveness.take_chain_reconnect() {
                        tracing::warn!("Chain listener: reconnect requested by health monitor");
                        return Err(FeedError::Timeout("new blocks"));
                    }
                }
                _ = running.changed() => {
                    if !*running.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Handle one JSON-RPC frame: subscription acks, backfill results, gas
    /// lookups, new heads and log notifications.
    fn handle_rpc_message(
        &self,
        text: &str,
        state: &mut ChainState,
        heads_sub: &mut Option<String>,
    ) -> Result<(), FeedError> {
        let msg: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "Chain listener: unparseable frame");
                return Ok(());
            }
        };

        if let Some(id) = msg.get("id").and_then(|v| v.as_u64()) {
            if let Some(err) = msg.get("error") {
                if id == LOGS_SUB_ID || id == HEADS_SUB_ID {
                    return Err(FeedError::Schema(format!("subscription rejected: {err}")));
                }
                tracing::warn!(id, error = %err, "Chain listener: rpc error");
                if let Some(pending) = state.gas_lookups.remove(&id) {
                    self.spawn_emit(pending, None);
                }
                return Ok(());
            }
            let result = msg.get("result").cloned().unwrap_or(serde_json::Value::Null);
            match id {
                LOGS_SUB_ID => {
                    tracing::info!(subscription = %result, "Subscribed to OrderFilled events on 2 contracts");
                }
                HEADS_SUB_ID => {
                    *heads_sub = result.as_str().map(str::to_string);
                    tracing::debug!(subscription = %result, "Subscribed to new heads");
                }
                BACKFILL_ID => {
                    let logs: Vec<RawLog> = serde_json::from_value(result).unwrap_or_default();
                    tracing::info!(logs = logs.len(), "Chain listener backfill received");
                    for log in &logs {
                        self.accept_log(log, state);
                    }
                }
                _ => {
                    if let Some(pending) = state.gas_lookups.remove(&id) {
                        let gas = result
                            .get("gasPrice")
                            .and_then(|g| g.as_str())
                            .and_then(parse_hex_u64)
                            .map(|wei| Decimal::from(wei) / Decimal::from(1_000_000_000u64));
                        self.spawn_emit(pending, gas);
                    }
                }
            }
            return Ok(());
        }

        let Some(params) = msg.get("params") else {
            return Ok(());
        };
        let Some(result) = params.get("result") else {
            return Ok(());
        };

        let is_head = match (params.get("subscription").and_then(|s| s.as_str()), heads_sub.as_deref()) {
            (Some(sub), Some(heads)) => sub == heads,
            _ => result.get("parentHash").is_some(),
        };

        if is_head {
            if let Some(block) = result.get("number").and_then(|n| n.as_str()).and_then(parse_hex_u64) {
                state.last_block = state.last_block.max(block);
                if let Some(ts) = result.get("timestamp").and_then(|t| t.as_str()).and_then(parse_hex_u64) {
                    state.clock.record(block, ts);
                }
                self.liveness.stamp_block(Utc::now());
            }
            return Ok(());
        }

        match serde_json::from_value::<RawLog>(result.clone()) {
            Ok(log) => self.accept_log(&log, state),
            Err(e) => count_decode_error(&DecodeError::Json(e)),
        }
        Ok(())
    }

    /// Decode a log and park it in the reorg buffer.
    fn accept_log(&self, log: &RawLog, state: &mut ChainState) {
        let now = Utc::now();
        self.liveness.stamp_chain_event(now);
        if let Some(block) = log.block() {
            state.last_block = state.last_block.max(block);
            if let Some(ts) = log.timestamp() {
                state.clock.record(block, ts);
            }
        }

        if log.removed {
            let (tx, idx) = (
                log.transaction_hash.clone().unwrap_or_default().to_lowercase(),
                log.index(),
            );
            let retracted = state
                .reorg
                .retract(|f| f.tx_hash == tx && Some(f.log_index) == idx);
            if retracted > 0 {
                tracing::warn!(tx = %tx, "Chain listener: pending fill removed by reorg");
            }
            return;
        }

        // Skip logs this process has already delivered (backfill overlap).
        if let (Some(tx), Some(idx)) = (log.transaction_hash.as_deref(), log.index()) {
            if self.dedup.is_known(&CanonicalId::chain(self.config.chain_id, tx, idx), now) {
                return;
            }
        }

        match decode_order_filled(log, &self.tracked) {
            Ok(Some(fill)) => {
                tracing::debug!(
                    wallet = %fill.wallet,
                    side = %fill.terms.side,
                    price = %fill.terms.price,
                    block = fill.block_number,
                    "Chain fill pending confirmation"
                );
                state.reorg.push(fill.block_number, fill, now);
            }
            Ok(None) => {}
            Err(e) => count_decode_error(&e),
        }
    }

    /// Release confirmed fills and request their transactions' gas prices.
    fn release_confirmed(&self, state: &mut ChainState) -> Vec<String> {
        let ready = state.reorg.release(state.last_block, Utc::now());

        let dropped = state.reorg.dropped();
        if dropped > state.reported_drops {
            let new_drops = dropped - state.reported_drops;
            metrics::counter!("reorg_dropped_total").increment(new_drops);
            tracing::warn!(dropped = new_drops, "Chain fills dropped as reorg losses");
            state.reported_drops = dropped;
        }

        let mut requests = Vec::with_capacity(ready.len());
        for fill in ready {
            let id = state.next_request_id;
            state.next_request_id += 1;
            let req = serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "eth_getTransactionByHash",
                "params": [fill.tx_hash]
            });
            requests.push(req.to_string());
            let block_time = state.clock.time_of(fill.block_number);
            state.gas_lookups.insert(
                id,
                PendingEmit {
                    fill,
                    block_time,
                    requested: Instant::now(),
                },
            );
        }
        requests
    }

    fn flush_gas_timeouts(&self, state: &mut ChainState) {
        let expired: Vec<u64> = state
            .gas_lookups
            .iter()
            .filter(|(_, pending)| pending.requested.elapsed() >= GAS_LOOKUP_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = state.gas_lookups.remove(&id) {
                self.spawn_emit(pending, None);
            }
        }
    }

    /// Resolve the fill's market off the socket task and forward the signal.
    fn spawn_emit(&self, pending: PendingEmit, gas_price_gwei: Option<Decimal>) {
        let PendingEmit { fill, block_time, .. } = pending;
        let market_data = Arc::clone(&self.market_data);
        let signal_tx = self.signal_tx.clone();
        let liveness = Arc::clone(&self.liveness);
        let parity = Arc::clone(&self.parity);
        let chain_id = self.config.chain_id;

        tokio::spawn(async move {
            let asset = match market_data.asset_info(&fill.terms.asset_id).await {
                Ok(a) => a,
                Err(e) => {
                    tracing::debug!(asset = %fill.terms.asset_id, error = %e, "Chain fill for unknown asset");
                    count_decode_error(&DecodeError::UnknownAsset(fill.terms.asset_id.clone()));
                    return;
                }
            };

            let now = Utc::now();
            let signal = TradeSignal {
                source: SignalSource::Chain,
                wallet: fill.wallet.clone(),
                market_id: asset.market_id.clone(),
                asset_id: fill.terms.asset_id.clone(),
                market_title: asset.title.clone(),
                outcome: asset.outcome,
                side: fill.terms.side,
                price: fill.terms.price,
                raw_size: fill.terms.size,
                usdc_value: fill.usdc_value().round_dp(2),
                whale_timestamp: whale_time(block_time, now),
                detected_at: now,
                canonical_id: CanonicalId::chain(chain_id, &fill.tx_hash, fill.log_index),
                score: 1,
                tx_hash: Some(fill.tx_hash.clone()),
                gas_price_gwei,
            };

            parity.record_chain(&signal);
            liveness.stamp_signal(now);
            metrics::counter!("signals_received_total", "source" => "chain").increment(1);
            tracing::info!(
                wallet = %signal.wallet,
                market = %signal.market_id,
                side = %signal.side,
                outcome = %signal.outcome,
                price = %signal.price,
                usdc = %signal.usdc_value,
                "Chain event: whale trade detected"
            );

            if let Err(e) = signal_tx.send(signal).await {
                tracing::error!(error = %e, "Failed to send chain signal to engine");
            }
        });
    }
}

fn count_decode_error(e: &DecodeError) {
    metrics::counter!("decode_errors_total", "source" => "chain").increment(1);
    tracing::debug!(error = %e, "Chain log dropped");
}
