/// Invoice Registry
///
/// Serializes invoice state transitions against the persistent store and
/// multiplexes change events to two classes of subscribers:
/// - global add/settle streams with exact backlog replay from the
///   store's monotonic indexes
/// - per-hash streams that observe every state of one invoice
///
/// Hold invoices park in Accepted until an out-of-band settle or cancel;
/// the HTLC side registers a one-shot hodl channel that receives the
/// resolution exactly once.
///
/// A single dispatcher task owns the subscription tables; every
/// subscriber gets its own queue and forwarder so a slow reader never
/// stalls event delivery.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{RegistryError, StoreError};
use crate::invoice_store::InvoiceStore;
use crate::metrics;
use crate::queue::ConcurrentQueue;
use crate::types::{HodlEvent, Invoice, InvoiceState, PaymentHash, Preimage};

/// An invoice change event as routed to subscribers. The event state can
/// differ from `invoice.state` during backlog replay, where adds are
/// replayed as Open regardless of where the invoice has moved since.
#[derive(Debug, Clone)]
pub struct InvoiceUpdate {
    pub state: InvoiceState,
    pub hash: PaymentHash,
    pub invoice: Invoice,
}

/// Decodes the minimum final CLTV expiry out of a raw payment request.
/// Injected so the registry never depends on a specific encoding.
pub trait PayReqDecoder: Send + Sync {
    fn min_final_cltv_expiry(&self, payment_request: &[u8]) -> Result<u64, RegistryError>;
}

/// Fixed-delta decoder used by tests and the demo daemon.
pub struct StaticCltvDecoder {
    pub delta: u64,
}

impl PayReqDecoder for StaticCltvDecoder {
    fn min_final_cltv_expiry(&self, _payment_request: &[u8]) -> Result<u64, RegistryError> {
        Ok(self.delta)
    }
}

static NEXT_HODL_CHAN_ID: AtomicU64 = AtomicU64::new(1);

/// One-shot sink for hold-invoice resolutions. The id is what the
/// registry's forward and reverse subscription tables key on.
#[derive(Clone)]
pub struct HodlChan {
    id: u64,
    tx: mpsc::UnboundedSender<HodlEvent>,
}

impl HodlChan {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HodlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: NEXT_HODL_CHAN_ID.fetch_add(1, Ordering::Relaxed),
                tx,
            },
            rx,
        )
    }
}

/// Global subscription: Open events on `new_invoices`, Settled events on
/// `settled_invoices`. Closure of either channel signifies cancellation
/// or shutdown.
pub struct InvoiceSubscription {
    pub new_invoices: mpsc::Receiver<Invoice>,
    pub settled_invoices: mpsc::Receiver<Invoice>,
    id: u64,
    cancelled: AtomicBool,
    cancel_tx: mpsc::Sender<u64>,
    cancel_token: CancellationToken,
    queue: ConcurrentQueue<InvoiceUpdate>,
    forwarder: std::sync::Mutex<Option<JoinHandle<()>>>,
    quit: CancellationToken,
}

/// Per-hash subscription: every state change of one invoice, in order.
pub struct SingleInvoiceSubscription {
    pub updates: mpsc::Receiver<Invoice>,
    pub hash: PaymentHash,
    id: u64,
    cancelled: AtomicBool,
    cancel_tx: mpsc::Sender<u64>,
    cancel_token: CancellationToken,
    queue: ConcurrentQueue<InvoiceUpdate>,
    forwarder: std::sync::Mutex<Option<JoinHandle<()>>>,
    quit: CancellationToken,
}

impl InvoiceSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Idempotent tear-down: posts the id to the dispatcher, stops the
    /// queue, signals the forwarder, and waits for it to exit.
    pub async fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        cancel_subscription(
            self.id,
            &self.cancel_tx,
            &self.queue,
            &self.cancel_token,
            &self.forwarder,
            &self.quit,
        )
        .await;
    }
}

impl SingleInvoiceSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        cancel_subscription(
            self.id,
            &self.cancel_tx,
            &self.queue,
            &self.cancel_token,
            &self.forwarder,
            &self.quit,
        )
        .await;
    }
}

async fn cancel_subscription(
    id: u64,
    cancel_tx: &mpsc::Sender<u64>,
    queue: &ConcurrentQueue<InvoiceUpdate>,
    cancel_token: &CancellationToken,
    forwarder: &std::sync::Mutex<Option<JoinHandle<()>>>,
    quit: &CancellationToken,
) {
    tokio::select! {
        biased;
        _ = quit.cancelled() => {}
        _ = cancel_tx.send(id) => {}
    }
    queue.stop().await;
    cancel_token.cancel();
    let handle = forwarder.lock().expect("forwarder lock").take();
    if let Some(handle) = handle {
        let _ = handle.await;
    }
}

struct AllClient {
    add_index: u64,
    settle_index: u64,
    queue_in: mpsc::UnboundedSender<InvoiceUpdate>,
}

struct SingleClient {
    hash: PaymentHash,
    queue_in: mpsc::UnboundedSender<InvoiceUpdate>,
}

struct NewAllSub {
    id: u64,
    add_index: u64,
    settle_index: u64,
    queue_in: mpsc::UnboundedSender<InvoiceUpdate>,
}

struct NewSingleSub {
    id: u64,
    hash: PaymentHash,
    queue_in: mpsc::UnboundedSender<InvoiceUpdate>,
}

#[derive(Default)]
struct HodlSubs {
    by_hash: HashMap<PaymentHash, HashMap<u64, mpsc::UnboundedSender<HodlEvent>>>,
    by_sink: HashMap<u64, HashSet<PaymentHash>>,
}

struct RegistryInputs {
    new_all_rx: mpsc::Receiver<NewAllSub>,
    new_single_rx: mpsc::Receiver<NewSingleSub>,
    cancel_rx: mpsc::Receiver<u64>,
    event_rx: mpsc::Receiver<InvoiceUpdate>,
}

pub struct InvoiceRegistry {
    store: Arc<dyn InvoiceStore>,
    decoder: Arc<dyn PayReqDecoder>,
    quit: CancellationToken,
    /// Serializes every mutating method so state transitions and their
    /// notifications cannot interleave.
    mutation_lock: tokio::sync::Mutex<()>,
    debug_invoices: std::sync::Mutex<HashMap<PaymentHash, Invoice>>,
    hodl: std::sync::Mutex<HodlSubs>,
    event_tx: mpsc::Sender<InvoiceUpdate>,
    new_all_tx: mpsc::Sender<NewAllSub>,
    new_single_tx: mpsc::Sender<NewSingleSub>,
    cancel_tx: mpsc::Sender<u64>,
    next_client_id: std::sync::Mutex<u64>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
    pending: std::sync::Mutex<Option<RegistryInputs>>,
}

/// Buffer sizes for per-subscription delivery channels.
const SUB_CHAN_CAPACITY: usize = 20;

impl InvoiceRegistry {
    pub fn new(store: Arc<dyn InvoiceStore>, decoder: Arc<dyn PayReqDecoder>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(100);
        let (new_all_tx, new_all_rx) = mpsc::channel(20);
        let (new_single_tx, new_single_rx) = mpsc::channel(20);
        let (cancel_tx, cancel_rx) = mpsc::channel(20);

        Self {
            store,
            decoder,
            quit: CancellationToken::new(),
            mutation_lock: tokio::sync::Mutex::new(()),
            debug_invoices: std::sync::Mutex::new(HashMap::new()),
            hodl: std::sync::Mutex::new(HodlSubs::default()),
            event_tx,
            new_all_tx,
            new_single_tx,
            cancel_tx,
            next_client_id: std::sync::Mutex::new(0),
            dispatcher: std::sync::Mutex::new(None),
            pending: std::sync::Mutex::new(Some(RegistryInputs {
                new_all_rx,
                new_single_rx,
                cancel_rx,
                event_rx,
            })),
        }
    }

    /// Spawn the dispatcher. Idempotent; later calls are no-ops.
    pub fn start(&self) {
        let inputs = self.pending.lock().expect("registry pending lock").take();
        let Some(inputs) = inputs else {
            return;
        };
        let quit = self.quit.clone();
        let handle = tokio::spawn(run_dispatcher(inputs, quit));
        *self.dispatcher.lock().expect("registry dispatcher lock") = Some(handle);
        info!("invoice registry started");
    }

    pub async fn stop(&self) {
        self.quit.cancel();
        let handle = self.dispatcher.lock().expect("registry dispatcher lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("invoice registry stopped");
    }

    /// Persist a new invoice and announce it as Open. Returns the add
    /// index assigned by the store.
    pub async fn add_invoice(
        &self,
        invoice: Invoice,
        hash: PaymentHash,
    ) -> Result<u64, RegistryError> {
        let _guard = self.mutation_lock.lock().await;

        let add_index = self.store.add_invoice(invoice.clone(), hash).await?;
        debug!(%hash, add_index, value_msat = invoice.terms.value_msat, "invoice added");
        metrics::INVOICES_ADDED.inc();

        let mut stored = invoice;
        stored.hash = hash;
        stored.add_index = add_index;
        self.notify_clients(InvoiceState::Open, hash, stored).await;
        Ok(add_index)
    }

    /// Register a volatile debug invoice, consulted ahead of the store.
    pub fn add_debug_invoice(&self, invoice: Invoice) {
        let hash = invoice.hash;
        self.debug_invoices
            .lock()
            .expect("debug invoices lock")
            .insert(hash, invoice);
        debug!(%hash, "debug invoice added");
    }

    /// Look up an invoice and the minimum final CLTV expiry decoded from
    /// its payment request. Debug invoices return a zero expiry.
    pub async fn lookup_invoice(
        &self,
        hash: &PaymentHash,
    ) -> Result<(Invoice, u64), RegistryError> {
        let debug_invoice = self
            .debug_invoices
            .lock()
            .expect("debug invoices lock")
            .get(hash)
            .cloned();
        if let Some(invoice) = debug_invoice {
            return Ok((invoice, 0));
        }

        let invoice = self.store.lookup_invoice(hash).await?;
        let min_cltv = self
            .decoder
            .min_final_cltv_expiry(&invoice.terms.payment_request)?;
        Ok((invoice, min_cltv))
    }

    /// HTLC-acceptance entry point for the exit hop.
    ///
    /// Returns the resolution when one is already determined (settle with
    /// the canonical preimage, or cancel), or `None` when the HTLC must
    /// be held; in the hold case `hodl_chan` is subscribed to the future
    /// resolution of this hash.
    pub async fn notify_exit_hop_htlc(
        &self,
        hash: PaymentHash,
        amt_paid_msat: u64,
        hodl_chan: &HodlChan,
    ) -> Result<Option<HodlEvent>, RegistryError> {
        let _guard = self.mutation_lock.lock().await;
        debug!(%hash, amt_paid_msat, "exit hop htlc accepted");

        let debug_invoice = self
            .debug_invoices
            .lock()
            .expect("debug invoices lock")
            .get(&hash)
            .cloned();
        if let Some(invoice) = debug_invoice {
            debug!(%hash, "settling debug invoice");
            return Ok(Some(HodlEvent {
                hash,
                preimage: Some(invoice.terms.preimage),
            }));
        }

        match self.store.accept_or_settle_invoice(&hash, amt_paid_msat).await {
            Ok(invoice) => match invoice.state {
                InvoiceState::Settled => {
                    info!(%hash, amt_paid_msat, "invoice settled");
                    metrics::INVOICES_SETTLED.inc();
                    let preimage = invoice.terms.preimage;
                    self.notify_clients(InvoiceState::Settled, hash, invoice).await;
                    Ok(Some(HodlEvent {
                        hash,
                        preimage: Some(preimage),
                    }))
                }
                InvoiceState::Accepted => {
                    info!(%hash, amt_paid_msat, "hold invoice accepted");
                    self.hodl_subscribe(hodl_chan, hash);
                    self.notify_clients(InvoiceState::Accepted, hash, invoice).await;
                    Ok(None)
                }
                state => Err(RegistryError::Store(StoreError::UnexpectedState(state))),
            },
            Err(StoreError::AlreadySettled) => {
                let invoice = self.store.lookup_invoice(&hash).await?;
                Ok(Some(HodlEvent {
                    hash,
                    preimage: Some(invoice.terms.preimage),
                }))
            }
            Err(StoreError::AlreadyCanceled) => Ok(Some(HodlEvent {
                hash,
                preimage: None,
            })),
            Err(StoreError::AlreadyAccepted) => {
                self.hodl_subscribe(hodl_chan, hash);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Settle an accepted hold invoice with its revealed preimage and
    /// resolve every hodl channel waiting on the hash.
    pub async fn settle_hodl_invoice(&self, preimage: Preimage) -> Result<(), RegistryError> {
        let _guard = self.mutation_lock.lock().await;

        let invoice = self.store.settle_hold_invoice(preimage).await?;
        let hash = invoice.hash;
        info!(%hash, "hold invoice settled");
        metrics::INVOICES_SETTLED.inc();

        self.hodl_resolve(
            hash,
            HodlEvent {
                hash,
                preimage: Some(preimage),
            },
        );
        self.notify_clients(InvoiceState::Settled, hash, invoice).await;
        Ok(())
    }

    /// Cancel an invoice. Idempotent: canceling an already-canceled
    /// invoice reports success.
    pub async fn cancel_invoice(&self, hash: PaymentHash) -> Result<(), RegistryError> {
        let _guard = self.mutation_lock.lock().await;
        debug!(%hash, "canceling invoice");

        match self.store.cancel_invoice(&hash).await {
            Ok(invoice) => {
                info!(%hash, "invoice canceled");
                metrics::INVOICES_CANCELED.inc();
                self.hodl_resolve(
                    hash,
                    HodlEvent {
                        hash,
                        preimage: None,
                    },
                );
                self.notify_clients(InvoiceState::Canceled, hash, invoice).await;
                Ok(())
            }
            Err(StoreError::AlreadyCanceled) => {
                debug!(%hash, "invoice already canceled");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Subscribe to the global add/settle streams with backlog replay:
    /// everything past `add_index` arrives as Open events, everything
    /// past `settle_index` as Settled events, then live events follow.
    pub async fn subscribe_notifications(
        &self,
        add_index: u64,
        settle_index: u64,
    ) -> Result<InvoiceSubscription, RegistryError> {
        let id = self.new_client_id();
        let (queue, queue_out) = ConcurrentQueue::new(SUB_CHAN_CAPACITY);
        let queue_in = queue.sender();
        queue.start();

        let (new_tx, new_rx) = mpsc::channel(SUB_CHAN_CAPACITY);
        let (settled_tx, settled_rx) = mpsc::channel(SUB_CHAN_CAPACITY);
        let cancel_token = CancellationToken::new();
        let forwarder = tokio::spawn(run_all_forwarder(
            queue_out,
            new_tx,
            settled_tx,
            cancel_token.clone(),
            self.quit.clone(),
        ));

        // Replay the backlog into the queue before the dispatcher knows
        // this client; the high-water marks passed along suppress any
        // duplicate arriving through the live path.
        let mut max_add = add_index;
        for invoice in self.store.invoices_added_since(add_index).await? {
            max_add = max_add.max(invoice.add_index);
            let _ = queue_in.send(InvoiceUpdate {
                state: InvoiceState::Open,
                hash: invoice.hash,
                invoice,
            });
        }
        let mut max_settle = settle_index;
        for invoice in self.store.invoices_settled_since(settle_index).await? {
            max_settle = max_settle.max(invoice.settle_index);
            let _ = queue_in.send(InvoiceUpdate {
                state: InvoiceState::Settled,
                hash: invoice.hash,
                invoice,
            });
        }

        self.send_new_all(NewAllSub {
            id,
            add_index: max_add,
            settle_index: max_settle,
            queue_in,
        })
        .await?;

        debug!(client = id, add_index, settle_index, "invoice subscription added");
        Ok(InvoiceSubscription {
            new_invoices: new_rx,
            settled_invoices: settled_rx,
            id,
            cancelled: AtomicBool::new(false),
            cancel_tx: self.cancel_tx.clone(),
            cancel_token,
            queue,
            forwarder: std::sync::Mutex::new(Some(forwarder)),
            quit: self.quit.clone(),
        })
    }

    /// Subscribe to one invoice's state changes. The current snapshot,
    /// if the invoice exists, is delivered first.
    pub async fn subscribe_single_invoice(
        &self,
        hash: PaymentHash,
    ) -> Result<SingleInvoiceSubscription, RegistryError> {
        let id = self.new_client_id();
        let (queue, queue_out) = ConcurrentQueue::new(SUB_CHAN_CAPACITY);
        let queue_in = queue.sender();
        queue.start();

        let (updates_tx, updates_rx) = mpsc::channel(SUB_CHAN_CAPACITY);
        let cancel_token = CancellationToken::new();
        let forwarder = tokio::spawn(run_single_forwarder(
            queue_out,
            updates_tx,
            cancel_token.clone(),
            self.quit.clone(),
        ));

        if let Ok(invoice) = self.store.lookup_invoice(&hash).await {
            let _ = queue_in.send(InvoiceUpdate {
                state: invoice.state,
                hash,
                invoice,
            });
        }

        self.send_new_single(NewSingleSub { id, hash, queue_in }).await?;

        debug!(client = id, %hash, "single invoice subscription added");
        Ok(SingleInvoiceSubscription {
            updates: updates_rx,
            hash,
            id,
            cancelled: AtomicBool::new(false),
            cancel_tx: self.cancel_tx.clone(),
            cancel_token,
            queue,
            forwarder: std::sync::Mutex::new(Some(forwarder)),
            quit: self.quit.clone(),
        })
    }

    /// Remove a hodl channel from every hash it watches.
    pub fn hodl_unsubscribe_all(&self, chan: &HodlChan) {
        let mut hodl = self.hodl.lock().expect("hodl lock");
        let Some(hashes) = hodl.by_sink.remove(&chan.id) else {
            return;
        };
        for hash in hashes {
            if let Some(subs) = hodl.by_hash.get_mut(&hash) {
                subs.remove(&chan.id);
                if subs.is_empty() {
                    hodl.by_hash.remove(&hash);
                }
            }
        }
        debug!(sink = chan.id, "hodl channel unsubscribed");
    }

    fn hodl_subscribe(&self, chan: &HodlChan, hash: PaymentHash) {
        let mut hodl = self.hodl.lock().expect("hodl lock");
        hodl.by_hash
            .entry(hash)
            .or_default()
            .insert(chan.id, chan.tx.clone());
        hodl.by_sink.entry(chan.id).or_default().insert(hash);
        debug!(sink = chan.id, %hash, "hodl channel subscribed");
    }

    /// Deliver a resolution to every channel watching `hash`, exactly
    /// once each, and drop the subscriptions from both tables.
    fn hodl_resolve(&self, hash: PaymentHash, event: HodlEvent) {
        let mut hodl = self.hodl.lock().expect("hodl lock");
        let Some(subs) = hodl.by_hash.remove(&hash) else {
            return;
        };
        for (sink_id, tx) in subs {
            let _ = tx.send(event);
            if let Some(hashes) = hodl.by_sink.get_mut(&sink_id) {
                hashes.remove(&hash);
                if hashes.is_empty() {
                    hodl.by_sink.remove(&sink_id);
                }
            }
        }
        debug!(%hash, "hodl subscribers resolved");
    }

    async fn notify_clients(&self, state: InvoiceState, hash: PaymentHash, invoice: Invoice) {
        let update = InvoiceUpdate {
            state,
            hash,
            invoice,
        };
        tokio::select! {
            biased;
            _ = self.quit.cancelled() => {
                debug!(%hash, "dropping invoice event, registry shutting down");
            }
            res = self.event_tx.send(update) => {
                if res.is_err() {
                    debug!(%hash, "dropping invoice event, dispatcher gone");
                }
            }
        }
    }

    async fn send_new_all(&self, sub: NewAllSub) -> Result<(), RegistryError> {
        tokio::select! {
            biased;
            _ = self.quit.cancelled() => Err(RegistryError::Exiting),
            res = self.new_all_tx.send(sub) => res.map_err(|_| RegistryError::Exiting),
        }
    }

    async fn send_new_single(&self, sub: NewSingleSub) -> Result<(), RegistryError> {
        tokio::select! {
            biased;
            _ = self.quit.cancelled() => Err(RegistryError::Exiting),
            res = self.new_single_tx.send(sub) => res.map_err(|_| RegistryError::Exiting),
        }
    }

    fn new_client_id(&self) -> u64 {
        let mut next = self.next_client_id.lock().expect("client id lock");
        *next += 1;
        *next
    }
}

async fn run_dispatcher(mut inputs: RegistryInputs, quit: CancellationToken) {
    let mut clients: HashMap<u64, AllClient> = HashMap::new();
    let mut singles: HashMap<u64, SingleClient> = HashMap::new();

    loop {
        tokio::select! {
            _ = quit.cancelled() => break,
            Some(sub) = inputs.new_all_rx.recv() => {
                clients.insert(sub.id, AllClient {
                    add_index: sub.add_index,
                    settle_index: sub.settle_index,
                    queue_in: sub.queue_in,
                });
                metrics::INVOICE_SUBSCRIPTIONS.with_label_values(&["all"]).set(clients.len() as i64);
            }
            Some(sub) = inputs.new_single_rx.recv() => {
                singles.insert(sub.id, SingleClient {
                    hash: sub.hash,
                    queue_in: sub.queue_in,
                });
                metrics::INVOICE_SUBSCRIPTIONS.with_label_values(&["single"]).set(singles.len() as i64);
            }
            Some(id) = inputs.cancel_rx.recv() => {
                if clients.remove(&id).is_some() {
                    metrics::INVOICE_SUBSCRIPTIONS.with_label_values(&["all"]).set(clients.len() as i64);
                }
                if singles.remove(&id).is_some() {
                    metrics::INVOICE_SUBSCRIPTIONS.with_label_values(&["single"]).set(singles.len() as i64);
                }
            }
            Some(update) = inputs.event_rx.recv() => {
                deliver(&mut clients, &singles, update);
            }
        }
    }
    debug!("invoice registry dispatcher exited");
}

/// Route one event. Global clients only see Open and Settled, gated by
/// their high-water marks; single clients see everything for their hash.
fn deliver(
    clients: &mut HashMap<u64, AllClient>,
    singles: &HashMap<u64, SingleClient>,
    update: InvoiceUpdate,
) {
    for (id, client) in clients.iter_mut() {
        match update.state {
            InvoiceState::Open => {
                let add_index = update.invoice.add_index;
                if client.add_index >= add_index {
                    continue;
                }
                if add_index > client.add_index + 1 {
                    warn!(
                        client = id,
                        client_index = client.add_index,
                        invoice_index = add_index,
                        "client missed add events"
                    );
                }
                let _ = client.queue_in.send(update.clone());
                client.add_index = add_index;
            }
            InvoiceState::Settled => {
                let settle_index = update.invoice.settle_index;
                if client.settle_index >= settle_index {
                    continue;
                }
                if settle_index > client.settle_index + 1 {
                    warn!(
                        client = id,
                        client_index = client.settle_index,
                        invoice_index = settle_index,
                        "client missed settle events"
                    );
                }
                let _ = client.queue_in.send(update.clone());
                client.settle_index = settle_index;
            }
            // Accepted and Canceled stay off the global streams.
            InvoiceState::Accepted | InvoiceState::Canceled => {}
        }
    }

    for single in singles.values() {
        if single.hash == update.hash {
            let _ = single.queue_in.send(update.clone());
        }
    }
}

async fn run_all_forwarder(
    mut queue_out: mpsc::Receiver<InvoiceUpdate>,
    new_tx: mpsc::Sender<Invoice>,
    settled_tx: mpsc::Sender<Invoice>,
    cancel: CancellationToken,
    quit: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = quit.cancelled() => break,
            update = queue_out.recv() => {
                let Some(update) = update else { break };
                let target = match update.state {
                    InvoiceState::Open => &new_tx,
                    InvoiceState::Settled => &settled_tx,
                    InvoiceState::Accepted | InvoiceState::Canceled => continue,
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = quit.cancelled() => break,
                    res = target.send(update.invoice) => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn run_single_forwarder(
    mut queue_out: mpsc::Receiver<InvoiceUpdate>,
    updates_tx: mpsc::Sender<Invoice>,
    cancel: CancellationToken,
    quit: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = quit.cancelled() => break,
            update = queue_out.recv() => {
                let Some(update) = update else { break };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = quit.cancelled() => break,
                    res = updates_tx.send(update.invoice) => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}
