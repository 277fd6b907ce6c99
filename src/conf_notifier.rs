/// Transaction Confirmation Notifier
///
/// Per-transaction confirmation state machine with reorg rewind:
/// - Register / UpdateConfDetails feed watched transactions in
/// - ConnectTip / DisconnectTip drive the machine from chain events
/// - subscribers observe a countdown on Updates, one Confirmed value,
///   and NegativeConf if the confirmation is reorged away
///
/// State lives behind a single mutex because registrations and historical
/// rescan results arrive from outside the dispatcher task. Heights must
/// arrive strictly in order; anything else is rejected without touching
/// state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bitcoin::{BlockHash, Script, Transaction, Txid};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::NotifierError;
use crate::hint_cache::ConfirmHintCache;
use crate::metrics;
use crate::queue::{event_channel, EventReceiver, EventSender};
use crate::types::{ConfId, TxConfirmation};

/// A registered confirmation request and its delivery channels.
pub struct ConfNtfn {
    pub conf_id: ConfId,
    pub txid: Txid,
    pub pk_script: Script,
    pub num_confs: u32,
    pub height_hint: u32,
    updates: EventSender<u32>,
    confirmed: EventSender<TxConfirmation>,
    negative_conf: EventSender<i32>,
    details: Option<TxConfirmation>,
    dispatched: bool,
}

/// Subscriber-visible side of a confirmation registration. Closure of any
/// channel signifies cancellation or shutdown.
pub struct ConfirmationEvent {
    /// Confirmations-remaining countdown, ending at a nonnegative value.
    pub updates: EventReceiver<u32>,
    /// Fires once the transaction reaches its requested depth.
    pub confirmed: EventReceiver<TxConfirmation>,
    /// Fires with the reorg depth if a dispatched confirmation is undone
    /// within the safety window.
    pub negative_conf: EventReceiver<i32>,
}

impl ConfNtfn {
    pub fn new(
        conf_id: ConfId,
        txid: Txid,
        pk_script: Script,
        num_confs: u32,
        height_hint: u32,
    ) -> Result<(Self, ConfirmationEvent), NotifierError> {
        if num_confs == 0 {
            return Err(NotifierError::InvalidNumConfs);
        }

        // The countdown can emit at most num_confs values before the
        // terminal Confirmed, so this buffer never forces the tip
        // transition to park on a slow reader.
        let (updates_tx, updates_rx) = event_channel(num_confs as usize + 1);
        let (confirmed_tx, confirmed_rx) = event_channel(1);
        let (negative_tx, negative_rx) = event_channel(1);

        Ok((
            Self {
                conf_id,
                txid,
                pk_script,
                num_confs,
                height_hint,
                updates: updates_tx,
                confirmed: confirmed_tx,
                negative_conf: negative_tx,
                details: None,
                dispatched: false,
            },
            ConfirmationEvent {
                updates: updates_rx,
                confirmed: confirmed_rx,
                negative_conf: negative_rx,
            },
        ))
    }
}

struct ConfState {
    current_height: u32,
    reorg_depth: u32,
    conf_by_txid: HashMap<Txid, HashMap<ConfId, ConfNtfn>>,
    /// Heights at which pending notifications reach their requested
    /// depth. An entry exists iff the notification has details and its
    /// confirmation height is still in the future.
    ntfns_by_confirm_height: HashMap<u32, HashSet<(Txid, ConfId)>>,
    /// First-inclusion heights of watched transactions, kept while the
    /// inclusion is within the reorg safety window.
    txs_by_initial_height: HashMap<u32, HashSet<Txid>>,
}

pub struct TxConfNotifier {
    reorg_safety_limit: u32,
    hint_cache: Arc<dyn ConfirmHintCache>,
    quit: CancellationToken,
    state: Mutex<ConfState>,
}

impl TxConfNotifier {
    pub fn new(
        start_height: u32,
        reorg_safety_limit: u32,
        hint_cache: Arc<dyn ConfirmHintCache>,
        quit: CancellationToken,
    ) -> Self {
        Self {
            reorg_safety_limit,
            hint_cache,
            quit,
            state: Mutex::new(ConfState {
                current_height: start_height,
                reorg_depth: 0,
                conf_by_txid: HashMap::new(),
                ntfns_by_confirm_height: HashMap::new(),
                txs_by_initial_height: HashMap::new(),
            }),
        }
    }

    /// Add a watched transaction. The hint cache is primed with the
    /// current height only for the first registration of a txid; later
    /// registrations inherit whatever hint already exists.
    pub async fn register(&self, ntfn: ConfNtfn) -> Result<(), NotifierError> {
        if self.quit.is_cancelled() {
            return Err(NotifierError::Exiting);
        }
        let mut state = self.state.lock().await;

        if !state.conf_by_txid.contains_key(&ntfn.txid) {
            if let Err(e) = self
                .hint_cache
                .commit_confirm_hint(state.current_height, &[ntfn.txid])
            {
                warn!(txid = %ntfn.txid, err = %e, "unable to prime confirm hint");
            }
        }

        debug!(
            txid = %ntfn.txid,
            conf_id = ntfn.conf_id,
            num_confs = ntfn.num_confs,
            height_hint = ntfn.height_hint,
            "registered confirmation notification"
        );
        state
            .conf_by_txid
            .entry(ntfn.txid)
            .or_default()
            .insert(ntfn.conf_id, ntfn);
        metrics::CONF_NTFNS_ACTIVE.inc();
        Ok(())
    }

    /// Attach confirmation details located by a historical rescan.
    ///
    /// Details above the current height are deferred: the upcoming
    /// ConnectTip for that block will stamp them. Otherwise the hint is
    /// committed at the confirmation height and the notification is
    /// either dispatched immediately or scheduled.
    pub async fn update_conf_details(
        &self,
        txid: Txid,
        conf_id: ConfId,
        details: TxConfirmation,
    ) -> Result<(), NotifierError> {
        if self.quit.is_cancelled() {
            return Err(NotifierError::Exiting);
        }
        let mut state = self.state.lock().await;
        let ConfState {
            current_height,
            conf_by_txid,
            ntfns_by_confirm_height,
            txs_by_initial_height,
            ..
        } = &mut *state;
        let current_height = *current_height;

        let ntfn = conf_by_txid
            .get_mut(&txid)
            .and_then(|ntfns| ntfns.get_mut(&conf_id))
            .ok_or_else(|| NotifierError::NotFound(format!("{}/{}", txid, conf_id)))?;

        if ntfn.details.is_some() {
            // The chain already stamped this notification; the rescan
            // result is stale.
            debug!(%txid, conf_id, "ignoring rescan details, already stamped");
            return Ok(());
        }
        if details.block_height > current_height {
            debug!(
                %txid,
                details_height = details.block_height,
                current_height,
                "deferring conf details until the block connects"
            );
            return Ok(());
        }

        if let Err(e) = self
            .hint_cache
            .commit_confirm_hint(details.block_height, &[txid])
        {
            warn!(%txid, err = %e, "unable to update confirm hint");
        }

        ntfn.details = Some(details);
        dispatch_conf_details(
            ntfn,
            details,
            current_height,
            self.reorg_safety_limit,
            ntfns_by_confirm_height,
            txs_by_initial_height,
            &self.quit,
        )
        .await
    }

    /// Advance the chain by exactly one block.
    pub async fn connect_tip(
        &self,
        block_hash: &BlockHash,
        height: u32,
        txns: &[Transaction],
    ) -> Result<(), NotifierError> {
        if self.quit.is_cancelled() {
            return Err(NotifierError::Exiting);
        }
        let mut state = self.state.lock().await;
        if height != state.current_height + 1 {
            return Err(NotifierError::OutOfOrder {
                expected: state.current_height + 1,
                got: height,
            });
        }
        state.current_height = height;
        state.reorg_depth = 0;
        metrics::CHAIN_TIP_HEIGHT.set(height as i64);
        metrics::BLOCKS_CONNECTED.inc();

        let ConfState {
            conf_by_txid,
            ntfns_by_confirm_height,
            txs_by_initial_height,
            ..
        } = &mut *state;

        // Stamp details onto every notification confirmed by this block.
        for (tx_index, tx) in txns.iter().enumerate() {
            let txid = tx.txid();
            let Some(ntfns) = conf_by_txid.get_mut(&txid) else {
                continue;
            };
            let details = TxConfirmation {
                block_hash: *block_hash,
                block_height: height,
                tx_index: tx_index as u32,
            };
            for ntfn in ntfns.values_mut() {
                ntfn.details = Some(details);
                ntfns_by_confirm_height
                    .entry(height + ntfn.num_confs - 1)
                    .or_default()
                    .insert((txid, ntfn.conf_id));
            }
            txs_by_initial_height.entry(height).or_default().insert(txid);
            debug!(%txid, height, "watched transaction confirmed");
        }

        // One batched hint commit per tip change: the txids confirmed
        // here plus everything still waiting for its first confirmation.
        // A partial-height hint must never hit disk.
        let mut hint_txids: Vec<Txid> = txs_by_initial_height
            .get(&height)
            .map(|txids| txids.iter().copied().collect())
            .unwrap_or_default();
        for (txid, ntfns) in conf_by_txid.iter() {
            if ntfns.values().all(|ntfn| ntfn.details.is_none()) {
                hint_txids.push(*txid);
            }
        }
        if !hint_txids.is_empty() {
            if let Err(e) = self.hint_cache.commit_confirm_hint(height, &hint_txids) {
                warn!(height, err = %e, "unable to batch-commit confirm hints");
            }
        }

        // Confs-remaining tick for every stamped notification that has
        // not fired yet. Past-dispatch notifications show up as strictly
        // negative remainders and are skipped.
        for txids in txs_by_initial_height.values() {
            for txid in txids {
                let Some(ntfns) = conf_by_txid.get_mut(txid) else {
                    continue;
                };
                for ntfn in ntfns.values_mut() {
                    let Some(details) = ntfn.details else {
                        continue;
                    };
                    let confirm_height = details.block_height + ntfn.num_confs - 1;
                    if confirm_height < height {
                        continue;
                    }
                    ntfn.updates.send(confirm_height - height, &self.quit).await?;
                }
            }
        }

        // Dispatch everything scheduled to reach its depth at this height.
        if let Some(scheduled) = ntfns_by_confirm_height.remove(&height) {
            for (txid, conf_id) in scheduled {
                let Some(ntfn) = conf_by_txid
                    .get_mut(&txid)
                    .and_then(|ntfns| ntfns.get_mut(&conf_id))
                else {
                    continue;
                };
                let Some(details) = ntfn.details else {
                    continue;
                };
                if ntfn.dispatched {
                    continue;
                }
                info!(
                    %txid,
                    num_confs = ntfn.num_confs,
                    confirmed_height = details.block_height,
                    "dispatching confirmation"
                );
                ntfn.confirmed.send(details, &self.quit).await?;
                ntfn.dispatched = true;
                metrics::CONF_NTFNS_DISPATCHED.inc();
            }
        }

        // Inclusions older than the safety window can no longer reorg;
        // drop their state and hints.
        if height >= self.reorg_safety_limit {
            let mature_height = height - self.reorg_safety_limit;
            if let Some(txids) = txs_by_initial_height.remove(&mature_height) {
                let mature: Vec<Txid> = txids.iter().copied().collect();
                for txid in &mature {
                    if let Some(ntfns) = conf_by_txid.remove(txid) {
                        metrics::CONF_NTFNS_ACTIVE.sub(ntfns.len() as i64);
                    }
                    debug!(%txid, mature_height, "pruned mature confirmation state");
                }
                if let Err(e) = self.hint_cache.purge_confirm_hint(&mature) {
                    warn!(err = %e, "unable to purge mature confirm hints");
                }
            }
        }

        Ok(())
    }

    /// Rewind the chain by exactly one block.
    pub async fn disconnect_tip(&self, height: u32) -> Result<(), NotifierError> {
        if self.quit.is_cancelled() {
            return Err(NotifierError::Exiting);
        }
        let mut state = self.state.lock().await;
        if height != state.current_height {
            return Err(NotifierError::OutOfOrder {
                expected: state.current_height,
                got: height,
            });
        }
        state.current_height = height - 1;
        state.reorg_depth += 1;
        let reorg_depth = state.reorg_depth;
        metrics::CHAIN_TIP_HEIGHT.set((height - 1) as i64);
        metrics::BLOCKS_DISCONNECTED.inc();

        let ConfState {
            current_height,
            conf_by_txid,
            ntfns_by_confirm_height,
            txs_by_initial_height,
            ..
        } = &mut *state;
        let current_height = *current_height;

        for (initial_height, txids) in txs_by_initial_height.iter() {
            for txid in txids {
                let Some(ntfns) = conf_by_txid.get_mut(txid) else {
                    continue;
                };
                for ntfn in ntfns.values_mut() {
                    // Flush any unread stale confirmation count. This
                    // runs for every watched transaction, whether or not
                    // it was part of the disconnected block.
                    let _ = ntfn.updates.try_drain();

                    if *initial_height != height {
                        continue;
                    }

                    if ntfn.dispatched {
                        // The confirmation we delivered is no longer on
                        // the active chain. Clear anything the subscriber
                        // has not read and tell them about the reorg.
                        let _ = ntfn.confirmed.try_drain();
                        let _ = ntfn.negative_conf.try_drain();
                        ntfn.dispatched = false;
                        ntfn.details = None;
                        info!(
                            %txid,
                            reorg_depth,
                            "dispatched confirmation reorged out"
                        );
                        ntfn.negative_conf
                            .send(reorg_depth as i32, &self.quit)
                            .await?;
                        metrics::NEGATIVE_CONFS.inc();
                    } else if let Some(details) = ntfn.details.take() {
                        let confirm_height = details.block_height + ntfn.num_confs - 1;
                        if let Some(set) = ntfns_by_confirm_height.get_mut(&confirm_height) {
                            set.remove(&(*txid, ntfn.conf_id));
                        }
                    }
                }
            }
        }

        // Every transaction that is now unconfirmed again (including the
        // ones just reorged out) gets its hint rewound to the new tip.
        let mut rewound: Vec<Txid> = Vec::new();
        for (txid, ntfns) in conf_by_txid.iter() {
            if ntfns.values().all(|ntfn| ntfn.details.is_none()) {
                rewound.push(*txid);
            }
        }
        if !rewound.is_empty() {
            if let Err(e) = self.hint_cache.commit_confirm_hint(current_height, &rewound) {
                warn!(height = current_height, err = %e, "unable to rewind confirm hints");
            }
        }

        txs_by_initial_height.remove(&height);
        Ok(())
    }

    /// Drop all notification state, closing every event channel.
    pub async fn teardown(&self) {
        let mut state = self.state.lock().await;
        let remaining: i64 = state.conf_by_txid.values().map(|n| n.len() as i64).sum();
        state.conf_by_txid.clear();
        state.ntfns_by_confirm_height.clear();
        state.txs_by_initial_height.clear();
        metrics::CONF_NTFNS_ACTIVE.sub(remaining);
    }

    /// Height of the last connected block, as seen by this notifier.
    pub async fn current_height(&self) -> u32 {
        self.state.lock().await.current_height
    }
}

/// Place a freshly-stamped notification into the delivery machinery:
/// immediate dispatch when the depth is already reached, scheduling
/// otherwise, plus re-org tracking while the inclusion is young enough.
async fn dispatch_conf_details(
    ntfn: &mut ConfNtfn,
    details: TxConfirmation,
    current_height: u32,
    reorg_safety_limit: u32,
    ntfns_by_confirm_height: &mut HashMap<u32, HashSet<(Txid, ConfId)>>,
    txs_by_initial_height: &mut HashMap<u32, HashSet<Txid>>,
    quit: &CancellationToken,
) -> Result<(), NotifierError> {
    let confirm_height = details.block_height + ntfn.num_confs - 1;

    if confirm_height <= current_height {
        if !ntfn.dispatched {
            info!(
                txid = %ntfn.txid,
                height = details.block_height,
                "dispatching historical confirmation"
            );
            ntfn.updates.send(0, quit).await?;
            ntfn.confirmed.send(details, quit).await?;
            ntfn.dispatched = true;
            metrics::CONF_NTFNS_DISPATCHED.inc();
        }
    } else {
        debug!(
            txid = %ntfn.txid,
            confirm_height,
            "queueing confirmation notification"
        );
        ntfns_by_confirm_height
            .entry(confirm_height)
            .or_default()
            .insert((ntfn.txid, ntfn.conf_id));
        ntfn.updates
            .send(confirm_height - current_height, quit)
            .await?;
    }

    if details.block_height + reorg_safety_limit > current_height {
        txs_by_initial_height
            .entry(details.block_height)
            .or_default()
            .insert(ntfn.txid);
    }

    Ok(())
}
