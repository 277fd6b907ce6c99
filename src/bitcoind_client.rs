/// bitcoind Block Source Driver
///
/// Feeds the chain notifier from a bitcoind node:
/// - raw JSON-RPC calls over HTTP (getblockcount / getblockhash /
///   getblock verbosity 0, consensus-decoded)
/// - LRU block cache so historical rescans do not refetch
/// - poll loop that detects tip advances and hash-mismatch reorgs,
///   walks back to the fork point, and emits the strictly-sequential
///   disconnect/connect events the dispatcher requires
///
/// Implements the LightClient seam by scanning full blocks: a bitcoind
/// backend has no client-side compact filters, and the block scan gives
/// identical answers.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::hex::FromHex;
use bitcoin::{Block, BlockHash, OutPoint, Script};
use lru::LruCache;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain_notifier::ChainNotifier;
use crate::errors::LightClientError;
use crate::light_client::{LightClient, UtxoStatus};
use crate::types::{FilteredBlock, SpendDetail};

const BLOCK_CACHE_SIZE: usize = 64;

pub struct BitcoindClient {
    url: String,
    user: String,
    pass: String,
    http: Arc<reqwest::blocking::Client>,
    block_cache: Mutex<LruCache<BlockHash, Block>>,
}

impl BitcoindClient {
    pub fn new(url: String, user: String, pass: String) -> Self {
        Self {
            url,
            user,
            pass,
            http: Arc::new(reqwest::blocking::Client::new()),
            block_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(BLOCK_CACHE_SIZE).expect("nonzero cache size"),
            )),
        }
    }

    /// Raw JSON-RPC call, run on the blocking pool.
    async fn call(&self, method: &str, params: Value) -> Result<Value, LightClientError> {
        let http = self.http.clone();
        let url = self.url.clone();
        let user = self.user.clone();
        let pass = self.pass.clone();
        let method = method.to_string();

        let result = tokio::task::spawn_blocking(move || {
            let response = http
                .post(&url)
                .basic_auth(&user, Some(&pass))
                .json(&json!({
                    "jsonrpc": "1.0",
                    "id": "lnwatch",
                    "method": method,
                    "params": params,
                }))
                .send()
                .map_err(|e| LightClientError::Backend(e.to_string()))?;

            let body: Value = response
                .json()
                .map_err(|e| LightClientError::Backend(e.to_string()))?;
            if let Some(err) = body.get("error") {
                if !err.is_null() {
                    return Err(LightClientError::Backend(err.to_string()));
                }
            }
            body.get("result")
                .cloned()
                .ok_or_else(|| LightClientError::Backend("no result in RPC response".to_string()))
        })
        .await
        .map_err(|e| LightClientError::Backend(e.to_string()))??;

        Ok(result)
    }

    pub async fn block_count(&self) -> Result<u32, LightClientError> {
        let result = self.call("getblockcount", json!([])).await?;
        result
            .as_u64()
            .map(|h| h as u32)
            .ok_or_else(|| LightClientError::Backend("non-numeric block count".to_string()))
    }

    pub async fn block_hash_at(&self, height: u32) -> Result<BlockHash, LightClientError> {
        let result = self.call("getblockhash", json!([height])).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| LightClientError::Backend("non-string block hash".to_string()))?;
        parse_block_hash(hex)
    }

    /// Fetch a block through the LRU cache, decoding the verbosity-0
    /// hex returned by getblock.
    pub async fn cached_block(&self, hash: &BlockHash) -> Result<Block, LightClientError> {
        if let Some(block) = self.block_cache.lock().expect("block cache lock").get(hash) {
            return Ok(block.clone());
        }

        let result = self.call("getblock", json!([hash.to_string(), 0])).await?;
        let hex_str = result
            .as_str()
            .ok_or_else(|| LightClientError::Backend("non-string block data".to_string()))?;
        let bytes = hex::decode(hex_str)
            .map_err(|e| LightClientError::Backend(format!("block hex: {}", e)))?;
        let block: Block = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| LightClientError::Backend(format!("block decode: {}", e)))?;

        self.block_cache
            .lock()
            .expect("block cache lock")
            .put(*hash, block.clone());
        Ok(block)
    }
}

fn parse_block_hash(hex_str: &str) -> Result<BlockHash, LightClientError> {
    BlockHash::from_hex(hex_str)
        .map_err(|e| LightClientError::Backend(format!("block hash: {}", e)))
}

#[async_trait]
impl LightClient for BitcoindClient {
    async fn block_hash(&self, height: u32) -> Result<BlockHash, LightClientError> {
        self.block_hash_at(height).await
    }

    async fn block(&self, hash: &BlockHash) -> Result<Block, LightClientError> {
        self.cached_block(hash).await
    }

    async fn filter_matches(
        &self,
        hash: &BlockHash,
        _height: u32,
        scripts: &[Script],
    ) -> Result<bool, LightClientError> {
        let block = self.cached_block(hash).await?;
        Ok(block.txdata.iter().any(|tx| {
            tx.output
                .iter()
                .any(|out| scripts.contains(&out.script_pubkey))
        }))
    }

    async fn get_utxo(
        &self,
        outpoint: &OutPoint,
        _pk_script: &Script,
        start_height: u32,
        end_height: u32,
    ) -> Result<UtxoStatus, LightClientError> {
        for height in start_height..=end_height {
            let hash = self.block_hash_at(height).await?;
            let block = self.cached_block(&hash).await?;
            for tx in &block.txdata {
                for (input_index, input) in tx.input.iter().enumerate() {
                    if input.previous_output == *outpoint {
                        return Ok(UtxoStatus::Spent(SpendDetail {
                            spent_outpoint: *outpoint,
                            spender_tx_hash: tx.txid(),
                            spender_input_index: input_index as u32,
                            spending_height: height,
                        }));
                    }
                }
            }
        }
        Ok(UtxoStatus::Unspent)
    }

    async fn update_filter(
        &self,
        _outpoints: &[OutPoint],
        _scripts: &[Script],
        _rewind_height: u32,
    ) -> Result<(), LightClientError> {
        // Full blocks are always fetched whole; there is no client-side
        // filter to maintain.
        Ok(())
    }
}

/// Poll bitcoind for tip changes and drive the notifier's connect and
/// disconnect callbacks. Keeps a window of recent block hashes so a
/// hash mismatch at the tip can be walked back to the fork point.
pub async fn run_block_monitor(
    client: Arc<BitcoindClient>,
    notifier: Arc<ChainNotifier>,
    poll_interval: Duration,
    window: u32,
    quit: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut tip_height = notifier.best_height();
    let mut recent: HashMap<u32, BlockHash> = HashMap::new();

    if tip_height > 0 {
        recent.insert(tip_height, client.block_hash_at(tip_height).await?);
    }
    info!(tip_height, "block monitor started");

    loop {
        tokio::select! {
            _ = quit.cancelled() => return Ok(()),
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let rpc_height = match client.block_count().await {
            Ok(height) => height,
            Err(e) => {
                warn!(err = %e, "failed to get chain tip");
                continue;
            }
        };

        // Hash mismatch at our tip means the chain reorganized under us.
        if let Some(our_hash) = recent.get(&tip_height).copied() {
            let rpc_hash = match client.block_hash_at(tip_height).await {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(err = %e, height = tip_height, "failed to compare tip hash");
                    continue;
                }
            };

            if our_hash != rpc_hash {
                let fork = match find_fork_point(&client, &recent, tip_height).await {
                    Ok(fork) => fork,
                    Err(e) => return Err(e.into()),
                };
                warn!(
                    tip_height,
                    fork, "chain reorganization detected, rewinding"
                );
                for height in (fork + 1..=tip_height).rev() {
                    let hash = recent
                        .remove(&height)
                        .ok_or("reorg deeper than tracked window")?;
                    notifier.on_block_disconnected(hash, height);
                }
                tip_height = fork;
            }
        }

        // Feed every new block, oldest first.
        while tip_height < rpc_height {
            if quit.is_cancelled() {
                return Ok(());
            }
            let next = tip_height + 1;
            let (hash, block) = match fetch_block_at(&client, next).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(err = %e, height = next, "failed to fetch block");
                    break;
                }
            };

            debug!(height = next, txs = block.txdata.len(), "connecting block");
            notifier.on_block_connected(FilteredBlock {
                hash,
                height: next,
                txns: block.txdata,
                connect: true,
            });

            recent.insert(next, hash);
            if next > window {
                recent.remove(&(next - window));
            }
            tip_height = next;
        }
    }
}

/// Walk backwards from below the mismatching tip to the last height
/// where our recorded hash still matches the RPC chain.
async fn find_fork_point(
    client: &BitcoindClient,
    recent: &HashMap<u32, BlockHash>,
    tip_height: u32,
) -> Result<u32, LightClientError> {
    let mut height = tip_height.saturating_sub(1);
    while height > 0 {
        let Some(our_hash) = recent.get(&height) else {
            // Below the tracked window; assume the chains agree here.
            break;
        };
        if client.block_hash_at(height).await? == *our_hash {
            break;
        }
        height -= 1;
    }
    Ok(height)
}

async fn fetch_block_at(
    client: &BitcoindClient,
    height: u32,
) -> Result<(BlockHash, Block), LightClientError> {
    let hash = client.block_hash_at(height).await?;
    let block = client.cached_block(&hash).await?;
    Ok((hash, block))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_block_hash() {
        let genesis = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = parse_block_hash(genesis).unwrap();
        assert_eq!(hash.to_string(), genesis);

        assert!(parse_block_hash("not-hex").is_err());
        assert!(parse_block_hash("abcd").is_err());
    }
}
