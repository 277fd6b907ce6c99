/// Light Client Seam
///
/// The chain notifier never talks to a backend directly; it consumes this
/// trait for historical rescans, the already-spent probe performed at
/// spend registration, and rescan filter maintenance. The bitcoind driver
/// implements it by scanning full blocks; a compact-filter backend would
/// answer the same questions from filters.

use async_trait::async_trait;
use bitcoin::{Block, BlockHash, OutPoint, Script};

use crate::errors::LightClientError;
use crate::types::SpendDetail;

/// Outcome of probing an outpoint against the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtxoStatus {
    /// The outpoint is unspent as of the probe's end height.
    Unspent,
    /// The outpoint was consumed by a mined transaction.
    Spent(SpendDetail),
}

#[async_trait]
pub trait LightClient: Send + Sync {
    /// Hash of the block at `height` on the active chain.
    async fn block_hash(&self, height: u32) -> Result<BlockHash, LightClientError>;

    /// Full block by hash.
    async fn block(&self, hash: &BlockHash) -> Result<Block, LightClientError>;

    /// Whether the block at (`hash`, `height`) is relevant to any of the
    /// given output scripts. Compact-filter backends answer from the
    /// filter header chain; full-block backends scan the block.
    async fn filter_matches(
        &self,
        hash: &BlockHash,
        height: u32,
        scripts: &[Script],
    ) -> Result<bool, LightClientError>;

    /// Probe whether `outpoint` has been spent by a transaction mined at
    /// or after `start_height`, scanning up to `end_height`.
    async fn get_utxo(
        &self,
        outpoint: &OutPoint,
        pk_script: &Script,
        start_height: u32,
        end_height: u32,
    ) -> Result<UtxoStatus, LightClientError>;

    /// Extend the live rescan filter with more watched outpoints and
    /// scripts, rewinding the scan to `rewind_height`.
    async fn update_filter(
        &self,
        outpoints: &[OutPoint],
        scripts: &[Script],
        rewind_height: u32,
    ) -> Result<(), LightClientError>;
}
