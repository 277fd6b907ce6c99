/// Chain Notifier
///
/// Central dispatcher for chain-driven notifications:
/// - confirmation registrations (delegated to the TxConfNotifier, with a
///   historical rescan so "already confirmed?" is answered up front)
/// - spend registrations per outpoint, with an already-spent UTXO probe
/// - block-epoch fan-out through per-client bounded queues
///
/// Exactly one dispatcher task owns the spend/epoch maps; everything else
/// reaches it through typed registration and cancellation channels. The
/// best height is published through a reader-writer lock so registration
/// paths can read it without touching the dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bitcoin::{OutPoint, Script, Txid};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conf_notifier::{ConfNtfn, ConfirmationEvent, TxConfNotifier};
use crate::errors::{LightClientError, NotifierError};
use crate::hint_cache::ConfirmHintCache;
use crate::light_client::{LightClient, UtxoStatus};
use crate::metrics;
use crate::queue::{event_channel, ConcurrentQueue, EventReceiver, EventSender};
use crate::types::{BlockEpoch, EpochId, FilteredBlock, SpendDetail, SpendId};

/// Per-client buffer sizes for epoch delivery. The queue absorbs bursts;
/// the output channel is what the subscriber reads.
const EPOCH_QUEUE_CAPACITY: usize = 20;
const EPOCH_CHAN_CAPACITY: usize = 20;

/// Poll cadence for the spend-registration height-hint wait.
const HINT_WAIT_POLL: Duration = Duration::from_millis(200);

/// A registered spend request and its delivery channel.
struct SpendNtfn {
    spend_id: SpendId,
    outpoint: OutPoint,
    pk_script: Script,
    height_hint: u32,
    event: EventSender<SpendDetail>,
}

/// Subscriber-visible side of a spend registration. The channel closes
/// after the single spend dispatch, on cancel, or on shutdown.
pub struct SpendEvent {
    pub spend: EventReceiver<SpendDetail>,
    pub spend_id: SpendId,
    pub outpoint: OutPoint,
}

/// Subscriber-visible side of a block-epoch registration.
pub struct BlockEpochEvent {
    pub epochs: mpsc::Receiver<BlockEpoch>,
    pub epoch_id: EpochId,
}

struct EpochRegistration {
    epoch_id: EpochId,
    queue: ConcurrentQueue<BlockEpoch>,
    queue_out: mpsc::Receiver<BlockEpoch>,
    epochs_tx: mpsc::Sender<BlockEpoch>,
    cancel: CancellationToken,
}

struct EpochClient {
    queue: ConcurrentQueue<BlockEpoch>,
    cancel: CancellationToken,
    mover: JoinHandle<()>,
}

enum Registration {
    Spend(SpendNtfn),
    Conf(ConfNtfn),
    Epoch(EpochRegistration),
}

enum CancelRequest {
    Spend { outpoint: OutPoint, spend_id: SpendId },
    Epoch { epoch_id: EpochId },
}

struct DispatcherInputs {
    reg_rx: mpsc::Receiver<Registration>,
    cancel_rx: mpsc::Receiver<CancelRequest>,
    updates_rx: mpsc::Receiver<FilteredBlock>,
    rescan_err_rx: mpsc::UnboundedReceiver<LightClientError>,
}

pub struct ChainNotifier {
    quit: CancellationToken,
    reg_tx: mpsc::Sender<Registration>,
    cancel_tx: mpsc::Sender<CancelRequest>,
    chain_updates: ConcurrentQueue<FilteredBlock>,
    best_height: Arc<RwLock<u32>>,
    txconf: Arc<TxConfNotifier>,
    light_client: Arc<dyn LightClient>,
    hint_cache: Arc<dyn ConfirmHintCache>,
    rescan_err_tx: mpsc::UnboundedSender<LightClientError>,
    next_id: AtomicU64,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
    pending: std::sync::Mutex<Option<DispatcherInputs>>,
}

impl ChainNotifier {
    pub fn new(
        start_height: u32,
        reorg_safety_limit: u32,
        light_client: Arc<dyn LightClient>,
        hint_cache: Arc<dyn ConfirmHintCache>,
    ) -> Self {
        let quit = CancellationToken::new();
        let (reg_tx, reg_rx) = mpsc::channel(20);
        let (cancel_tx, cancel_rx) = mpsc::channel(20);
        let (chain_updates, updates_rx) = ConcurrentQueue::new(20);
        let (rescan_err_tx, rescan_err_rx) = mpsc::unbounded_channel();

        let txconf = Arc::new(TxConfNotifier::new(
            start_height,
            reorg_safety_limit,
            hint_cache.clone(),
            quit.clone(),
        ));

        Self {
            quit,
            reg_tx,
            cancel_tx,
            chain_updates,
            best_height: Arc::new(RwLock::new(start_height)),
            txconf,
            light_client,
            hint_cache,
            rescan_err_tx,
            next_id: AtomicU64::new(1),
            dispatcher: std::sync::Mutex::new(None),
            pending: std::sync::Mutex::new(Some(DispatcherInputs {
                reg_rx,
                cancel_rx,
                updates_rx,
                rescan_err_rx,
            })),
        }
    }

    /// Spawn the dispatcher. Idempotent; later calls are no-ops.
    pub fn start(&self) {
        let inputs = self.pending.lock().expect("notifier pending lock").take();
        let Some(inputs) = inputs else {
            return;
        };
        self.chain_updates.start();

        let dispatcher = Dispatcher {
            quit: self.quit.clone(),
            best_height: self.best_height.clone(),
            txconf: self.txconf.clone(),
            light_client: self.light_client.clone(),
            spend_by_outpoint: HashMap::new(),
            epoch_clients: HashMap::new(),
        };
        let handle = tokio::spawn(dispatcher.run(inputs));
        *self.dispatcher.lock().expect("notifier dispatcher lock") = Some(handle);
        info!(height = read_height(&self.best_height), "chain notifier started");
    }

    /// Cancel the quit signal, wait for the dispatcher, and close every
    /// remaining notification channel.
    pub async fn stop(&self) {
        self.quit.cancel();
        let handle = self.dispatcher.lock().expect("notifier dispatcher lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.chain_updates.stop().await;
        self.txconf.teardown().await;
        info!("chain notifier stopped");
    }

    /// Block-source callback: a filtered block joined the active chain.
    pub fn on_block_connected(&self, block: FilteredBlock) {
        self.chain_updates.send(block);
    }

    /// Block-source callback: the tip block left the active chain.
    pub fn on_block_disconnected(&self, hash: bitcoin::BlockHash, height: u32) {
        self.chain_updates.send(FilteredBlock {
            hash,
            height,
            txns: Vec::new(),
            connect: false,
        });
    }

    /// Sink for asynchronous rescan errors from the block source; the
    /// dispatcher surfaces them in the log stream.
    pub fn rescan_error_sink(&self) -> mpsc::UnboundedSender<LightClientError> {
        self.rescan_err_tx.clone()
    }

    /// Height of the best known block.
    pub fn best_height(&self) -> u32 {
        read_height(&self.best_height)
    }

    /// Watch a transaction until it reaches `num_confs` confirmations.
    /// A cached height hint supersedes the caller's when further along.
    pub async fn register_confirmation_ntfn(
        &self,
        txid: Txid,
        pk_script: Script,
        num_confs: u32,
        height_hint: u32,
    ) -> Result<ConfirmationEvent, NotifierError> {
        let conf_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let hint = match self.hint_cache.query_confirm_hint(&txid) {
            Ok(cached) if cached > height_hint => {
                debug!(%txid, cached, height_hint, "using cached confirm hint");
                cached
            }
            _ => height_hint,
        };

        let (ntfn, event) = ConfNtfn::new(conf_id, txid, pk_script, num_confs, hint)?;
        self.send_registration(Registration::Conf(ntfn)).await?;
        Ok(event)
    }

    /// Watch an outpoint until it is spent by a mined transaction.
    ///
    /// Waits for the dispatcher to reach the height hint, then probes
    /// whether the spend already happened; historical spends dispatch
    /// from a fresh task without ever entering the dispatcher's map.
    pub async fn register_spend_ntfn(
        &self,
        outpoint: OutPoint,
        pk_script: Script,
        height_hint: u32,
    ) -> Result<SpendEvent, NotifierError> {
        let spend_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (event_tx, event_rx) = event_channel(1);

        loop {
            if read_height(&self.best_height) >= height_hint {
                break;
            }
            tokio::select! {
                _ = self.quit.cancelled() => return Err(NotifierError::Exiting),
                _ = tokio::time::sleep(HINT_WAIT_POLL) => {}
            }
        }

        let best = read_height(&self.best_height);
        match self
            .light_client
            .get_utxo(&outpoint, &pk_script, height_hint, best)
            .await
        {
            Ok(UtxoStatus::Spent(detail)) => {
                info!(
                    %outpoint,
                    spending_height = detail.spending_height,
                    "outpoint already spent, dispatching historically"
                );
                let quit = self.quit.clone();
                tokio::spawn(async move {
                    let _ = event_tx.send(detail, &quit).await;
                });
                metrics::SPEND_NTFNS_DISPATCHED.inc();
                return Ok(SpendEvent {
                    spend: event_rx,
                    spend_id,
                    outpoint,
                });
            }
            Ok(UtxoStatus::Unspent) => {}
            Err(e) => {
                warn!(%outpoint, err = %e, "utxo probe failed, falling back to live watch");
            }
        }

        self.send_registration(Registration::Spend(SpendNtfn {
            spend_id,
            outpoint,
            pk_script,
            height_hint,
            event: event_tx,
        }))
        .await?;
        Ok(SpendEvent {
            spend: event_rx,
            spend_id,
            outpoint,
        })
    }

    /// Subscribe to block epochs: one event per block joining the chain.
    pub async fn register_block_epoch_ntfn(&self) -> Result<BlockEpochEvent, NotifierError> {
        let epoch_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, queue_out) = ConcurrentQueue::new(EPOCH_QUEUE_CAPACITY);
        let (epochs_tx, epochs_rx) = mpsc::channel(EPOCH_CHAN_CAPACITY);

        self.send_registration(Registration::Epoch(EpochRegistration {
            epoch_id,
            queue,
            queue_out,
            epochs_tx,
            cancel: CancellationToken::new(),
        }))
        .await?;
        Ok(BlockEpochEvent {
            epochs: epochs_rx,
            epoch_id,
        })
    }

    pub async fn cancel_spend_ntfn(
        &self,
        outpoint: OutPoint,
        spend_id: SpendId,
    ) -> Result<(), NotifierError> {
        self.send_cancel(CancelRequest::Spend { outpoint, spend_id })
            .await
    }

    pub async fn cancel_epoch_ntfn(&self, epoch_id: EpochId) -> Result<(), NotifierError> {
        self.send_cancel(CancelRequest::Epoch { epoch_id }).await
    }

    async fn send_registration(&self, reg: Registration) -> Result<(), NotifierError> {
        tokio::select! {
            biased;
            _ = self.quit.cancelled() => Err(NotifierError::Exiting),
            res = self.reg_tx.send(reg) => res.map_err(|_| NotifierError::Exiting),
        }
    }

    async fn send_cancel(&self, cancel: CancelRequest) -> Result<(), NotifierError> {
        tokio::select! {
            biased;
            _ = self.quit.cancelled() => Err(NotifierError::Exiting),
            res = self.cancel_tx.send(cancel) => res.map_err(|_| NotifierError::Exiting),
        }
    }
}

fn read_height(height: &RwLock<u32>) -> u32 {
    *height.read().expect("best height lock")
}

struct Dispatcher {
    quit: CancellationToken,
    best_height: Arc<RwLock<u32>>,
    txconf: Arc<TxConfNotifier>,
    light_client: Arc<dyn LightClient>,
    spend_by_outpoint: HashMap<OutPoint, HashMap<SpendId, SpendNtfn>>,
    epoch_clients: HashMap<EpochId, EpochClient>,
}

impl Dispatcher {
    async fn run(mut self, mut inputs: DispatcherInputs) {
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => break,
                Some(reg) = inputs.reg_rx.recv() => self.handle_registration(reg).await,
                Some(cancel) = inputs.cancel_rx.recv() => self.handle_cancel(cancel).await,
                Some(block) = inputs.updates_rx.recv() => {
                    if block.connect {
                        self.handle_connected_block(block).await;
                    } else {
                        self.handle_disconnected_block(block).await;
                    }
                }
                Some(err) = inputs.rescan_err_rx.recv() => {
                    error!(err = %err, "rescan error from block source");
                }
            }
        }

        // Tear down epoch clients; dropping the spend map closes the
        // remaining spend channels.
        for (_, client) in self.epoch_clients.drain() {
            client.cancel.cancel();
            client.queue.stop().await;
            let _ = client.mover.await;
        }
        metrics::EPOCH_CLIENTS.set(0);
        debug!("chain notifier dispatcher exited");
    }

    async fn handle_registration(&mut self, reg: Registration) {
        match reg {
            Registration::Conf(ntfn) => self.handle_conf_registration(ntfn).await,
            Registration::Spend(ntfn) => {
                debug!(
                    outpoint = %ntfn.outpoint,
                    spend_id = ntfn.spend_id,
                    height_hint = ntfn.height_hint,
                    "registered spend notification"
                );
                let outpoint = ntfn.outpoint;
                let pk_script = ntfn.pk_script.clone();
                self.spend_by_outpoint
                    .entry(outpoint)
                    .or_default()
                    .insert(ntfn.spend_id, ntfn);
                metrics::SPEND_NTFNS_ACTIVE.inc();

                let rewind = read_height(&self.best_height);
                if let Err(e) = self
                    .light_client
                    .update_filter(&[outpoint], std::slice::from_ref(&pk_script), rewind)
                    .await
                {
                    warn!(%outpoint, err = %e, "unable to extend rescan filter");
                }
            }
            Registration::Epoch(reg) => {
                debug!(epoch_id = reg.epoch_id, "registered block epoch client");
                reg.queue.start();
                let mover = tokio::spawn(run_epoch_mover(
                    reg.queue_out,
                    reg.epochs_tx,
                    reg.cancel.clone(),
                    self.quit.clone(),
                ));
                self.epoch_clients.insert(
                    reg.epoch_id,
                    EpochClient {
                        queue: reg.queue,
                        cancel: reg.cancel,
                        mover,
                    },
                );
                metrics::EPOCH_CLIENTS.set(self.epoch_clients.len() as i64);
            }
        }
    }

    /// Answer "already confirmed?" with a filter-driven rescan, then hand
    /// the notification to the confirmation engine.
    async fn handle_conf_registration(&mut self, ntfn: ConfNtfn) {
        let txid = ntfn.txid;
        let conf_id = ntfn.conf_id;
        let pk_script = ntfn.pk_script.clone();
        let height_hint = ntfn.height_hint;
        let current_height = read_height(&self.best_height);

        let details = match self
            .historical_conf_details(txid, &pk_script, height_hint, current_height)
            .await
        {
            Ok(details) => details,
            Err(e) => {
                error!(%txid, err = %e, "historical confirmation rescan failed");
                None
            }
        };

        if let Err(e) = self.txconf.register(ntfn).await {
            error!(%txid, err = %e, "unable to register confirmation notification");
            return;
        }

        match details {
            Some(details) => {
                if let Err(e) = self.txconf.update_conf_details(txid, conf_id, details).await {
                    error!(%txid, err = %e, "unable to attach historical conf details");
                }
            }
            None => {
                if let Err(e) = self
                    .light_client
                    .update_filter(&[], std::slice::from_ref(&pk_script), current_height)
                    .await
                {
                    warn!(%txid, err = %e, "unable to extend rescan filter");
                }
            }
        }
    }

    /// Scan compact filters forward from the height hint, fetching only
    /// matching blocks, and locate the transaction's inclusion.
    async fn historical_conf_details(
        &self,
        txid: Txid,
        pk_script: &Script,
        height_hint: u32,
        current_height: u32,
    ) -> Result<Option<crate::types::TxConfirmation>, LightClientError> {
        for height in height_hint..=current_height {
            let hash = self.light_client.block_hash(height).await?;
            let matches = self
                .light_client
                .filter_matches(&hash, height, std::slice::from_ref(pk_script))
                .await?;
            if !matches {
                continue;
            }

            let block = self.light_client.block(&hash).await?;
            for (tx_index, tx) in block.txdata.iter().enumerate() {
                if tx.txid() == txid {
                    debug!(%txid, height, tx_index, "historical rescan located confirmation");
                    return Ok(Some(crate::types::TxConfirmation {
                        block_hash: hash,
                        block_height: height,
                        tx_index: tx_index as u32,
                    }));
                }
            }
        }
        Ok(None)
    }

    async fn handle_cancel(&mut self, cancel: CancelRequest) {
        match cancel {
            CancelRequest::Spend { outpoint, spend_id } => {
                let mut emptied = false;
                if let Some(ntfns) = self.spend_by_outpoint.get_mut(&outpoint) {
                    if ntfns.remove(&spend_id).is_some() {
                        debug!(%outpoint, spend_id, "canceled spend notification");
                        metrics::SPEND_NTFNS_ACTIVE.dec();
                    }
                    emptied = ntfns.is_empty();
                }
                if emptied {
                    self.spend_by_outpoint.remove(&outpoint);
                }
            }
            CancelRequest::Epoch { epoch_id } => {
                if let Some(client) = self.epoch_clients.remove(&epoch_id) {
                    debug!(epoch_id, "canceled block epoch client");
                    client.cancel.cancel();
                    client.queue.stop().await;
                    let _ = client.mover.await;
                    metrics::EPOCH_CLIENTS.set(self.epoch_clients.len() as i64);
                }
            }
        }
    }

    async fn handle_connected_block(&mut self, block: FilteredBlock) {
        let expected = read_height(&self.best_height) + 1;
        if block.height != expected {
            warn!(
                height = block.height,
                expected, "out of order connected block, dropping"
            );
            return;
        }
        *self.best_height.write().expect("best height lock") = block.height;

        // Dispatch spends for every watched outpoint consumed here.
        for tx in &block.txns {
            let spender = tx.txid();
            for (input_index, input) in tx.input.iter().enumerate() {
                let Some(ntfns) = self.spend_by_outpoint.remove(&input.previous_output) else {
                    continue;
                };
                for (_, ntfn) in ntfns {
                    let detail = SpendDetail {
                        spent_outpoint: ntfn.outpoint,
                        spender_tx_hash: spender,
                        spender_input_index: input_index as u32,
                        spending_height: block.height,
                    };
                    info!(
                        outpoint = %ntfn.outpoint,
                        spender = %spender,
                        height = block.height,
                        "dispatching spend notification"
                    );
                    metrics::SPEND_NTFNS_ACTIVE.dec();
                    if ntfn.event.send(detail, &self.quit).await.is_err() {
                        return;
                    }
                    metrics::SPEND_NTFNS_DISPATCHED.inc();
                    // The notification drops here, closing its channel.
                }
            }
        }

        match self
            .txconf
            .connect_tip(&block.hash, block.height, &block.txns)
            .await
        {
            Ok(()) | Err(NotifierError::Exiting) => {}
            Err(e) => error!(height = block.height, err = %e, "connect tip failed"),
        }

        for client in self.epoch_clients.values() {
            client.queue.send(BlockEpoch {
                hash: block.hash,
                height: block.height,
            });
        }
    }

    async fn handle_disconnected_block(&mut self, block: FilteredBlock) {
        let expected = read_height(&self.best_height);
        if block.height != expected {
            warn!(
                height = block.height,
                expected, "out of order disconnected block, dropping"
            );
            return;
        }
        *self.best_height.write().expect("best height lock") = block.height - 1;

        match self.txconf.disconnect_tip(block.height).await {
            Ok(()) | Err(NotifierError::Exiting) => {}
            Err(e) => error!(height = block.height, err = %e, "disconnect tip failed"),
        }
    }
}

async fn run_epoch_mover(
    mut queue_out: mpsc::Receiver<BlockEpoch>,
    out: mpsc::Sender<BlockEpoch>,
    cancel: CancellationToken,
    quit: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = quit.cancelled() => break,
            epoch = queue_out.recv() => {
                let Some(epoch) = epoch else { break };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = quit.cancelled() => break,
                    res = out.send(epoch) => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}
