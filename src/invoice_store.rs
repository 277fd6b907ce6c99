/// Invoice Store
///
/// Contract of the persistent invoice store the registry drives, plus an
/// in-memory reference implementation. The store owns the two monotonic
/// indexes (`add_index` at insert, `settle_index` at settlement) that make
/// exact backlog replay possible; subscribers reconnect with the last
/// index they durably processed, never with wall-clock cursors.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::StoreError;
use crate::types::{Invoice, InvoiceState, PaymentHash, Preimage};

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Insert a new invoice keyed by `hash` and return its assigned
    /// add index.
    async fn add_invoice(&self, invoice: Invoice, hash: PaymentHash) -> Result<u64, StoreError>;

    async fn lookup_invoice(&self, hash: &PaymentHash) -> Result<Invoice, StoreError>;

    /// Atomic HTLC-acceptance transition. Settles invoices with a known
    /// preimage, moves hold invoices to accepted, and reports conflicts
    /// with the current state as typed errors.
    async fn accept_or_settle_invoice(
        &self,
        hash: &PaymentHash,
        amt_paid_msat: u64,
    ) -> Result<Invoice, StoreError>;

    /// Settle an accepted hold invoice with its revealed preimage.
    async fn settle_hold_invoice(&self, preimage: Preimage) -> Result<Invoice, StoreError>;

    async fn cancel_invoice(&self, hash: &PaymentHash) -> Result<Invoice, StoreError>;

    /// All invoices with `add_index > index`, in add order.
    async fn invoices_added_since(&self, index: u64) -> Result<Vec<Invoice>, StoreError>;

    /// All settled invoices with `settle_index > index`, in settle order.
    async fn invoices_settled_since(&self, index: u64) -> Result<Vec<Invoice>, StoreError>;
}

#[derive(Default)]
struct StoreInner {
    invoices: HashMap<PaymentHash, Invoice>,
    /// add_index -> hash, dense and strictly increasing.
    add_order: BTreeMap<u64, PaymentHash>,
    /// settle_index -> hash, dense and strictly increasing.
    settle_order: BTreeMap<u64, PaymentHash>,
    next_add_index: u64,
    next_settle_index: u64,
}

/// In-memory store used by tests and the demo daemon. State transitions
/// follow the invoice DAG; anything else is a typed conflict error.
#[derive(Default)]
pub struct MemInvoiceStore {
    inner: Mutex<StoreInner>,
}

impl MemInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Conflict error describing the terminal/accepted state an operation
/// collided with.
fn state_conflict(state: InvoiceState) -> StoreError {
    match state {
        InvoiceState::Settled => StoreError::AlreadySettled,
        InvoiceState::Canceled => StoreError::AlreadyCanceled,
        InvoiceState::Accepted => StoreError::AlreadyAccepted,
        InvoiceState::Open => StoreError::UnexpectedState(InvoiceState::Open),
    }
}

#[async_trait]
impl InvoiceStore for MemInvoiceStore {
    async fn add_invoice(&self, mut invoice: Invoice, hash: PaymentHash) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.invoices.contains_key(&hash) {
            return Err(StoreError::DuplicateInvoice);
        }

        inner.next_add_index += 1;
        let add_index = inner.next_add_index;
        invoice.hash = hash;
        invoice.add_index = add_index;
        inner.add_order.insert(add_index, hash);
        inner.invoices.insert(hash, invoice);

        debug!(%hash, add_index, "added invoice");
        Ok(add_index)
    }

    async fn lookup_invoice(&self, hash: &PaymentHash) -> Result<Invoice, StoreError> {
        let inner = self.inner.lock().await;
        inner.invoices.get(hash).cloned().ok_or(StoreError::NotFound)
    }

    async fn accept_or_settle_invoice(
        &self,
        hash: &PaymentHash,
        amt_paid_msat: u64,
    ) -> Result<Invoice, StoreError> {
        let mut inner = self.inner.lock().await;
        let state = {
            let invoice = inner.invoices.get(hash).ok_or(StoreError::NotFound)?;
            invoice.state
        };
        if state != InvoiceState::Open {
            return Err(state_conflict(state));
        }

        let hold = {
            let invoice = inner.invoices.get(hash).ok_or(StoreError::NotFound)?;
            invoice.terms.preimage.is_unknown()
        };

        if hold {
            let invoice = inner.invoices.get_mut(hash).ok_or(StoreError::NotFound)?;
            invoice.state = InvoiceState::Accepted;
            invoice.amt_paid_msat = amt_paid_msat;
            Ok(invoice.clone())
        } else {
            inner.next_settle_index += 1;
            let settle_index = inner.next_settle_index;
            inner.settle_order.insert(settle_index, *hash);

            let invoice = inner.invoices.get_mut(hash).ok_or(StoreError::NotFound)?;
            invoice.state = InvoiceState::Settled;
            invoice.settle_index = settle_index;
            invoice.amt_paid_msat = amt_paid_msat;
            Ok(invoice.clone())
        }
    }

    async fn settle_hold_invoice(&self, preimage: Preimage) -> Result<Invoice, StoreError> {
        let hash = preimage.payment_hash();
        let mut inner = self.inner.lock().await;
        let state = {
            let invoice = inner.invoices.get(&hash).ok_or(StoreError::NotFound)?;
            invoice.state
        };
        match state {
            InvoiceState::Accepted => {}
            InvoiceState::Settled => return Err(StoreError::AlreadySettled),
            InvoiceState::Canceled => return Err(StoreError::AlreadyCanceled),
            // A hold invoice must be accepted before it can settle.
            InvoiceState::Open => return Err(StoreError::UnexpectedState(InvoiceState::Open)),
        }

        inner.next_settle_index += 1;
        let settle_index = inner.next_settle_index;
        inner.settle_order.insert(settle_index, hash);

        let invoice = inner.invoices.get_mut(&hash).ok_or(StoreError::NotFound)?;
        invoice.state = InvoiceState::Settled;
        invoice.terms.preimage = preimage;
        invoice.settle_index = settle_index;
        Ok(invoice.clone())
    }

    async fn cancel_invoice(&self, hash: &PaymentHash) -> Result<Invoice, StoreError> {
        let mut inner = self.inner.lock().await;
        let state = {
            let invoice = inner.invoices.get(hash).ok_or(StoreError::NotFound)?;
            invoice.state
        };
        match state {
            InvoiceState::Open | InvoiceState::Accepted => {}
            InvoiceState::Settled => return Err(StoreError::AlreadySettled),
            InvoiceState::Canceled => return Err(StoreError::AlreadyCanceled),
        }

        let invoice = inner.invoices.get_mut(hash).ok_or(StoreError::NotFound)?;
        invoice.state = InvoiceState::Canceled;
        Ok(invoice.clone())
    }

    async fn invoices_added_since(&self, index: u64) -> Result<Vec<Invoice>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .add_order
            .range(index + 1..)
            .filter_map(|(_, hash)| inner.invoices.get(hash).cloned())
            .collect())
    }

    async fn invoices_settled_since(&self, index: u64) -> Result<Vec<Invoice>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .settle_order
            .range(index + 1..)
            .filter_map(|(_, hash)| inner.invoices.get(hash).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InvoiceTerms, UNKNOWN_PREIMAGE};

    fn make_invoice(preimage: Preimage, value_msat: u64) -> (Invoice, PaymentHash) {
        let hash = preimage.payment_hash();
        let invoice = Invoice::new(
            hash,
            InvoiceTerms {
                value_msat,
                preimage,
                payment_request: vec![0x01; 32],
            },
            1_700_000_000,
        );
        (invoice, hash)
    }

    fn hold_invoice(hash: PaymentHash, value_msat: u64) -> Invoice {
        Invoice::new(
            hash,
            InvoiceTerms {
                value_msat,
                preimage: UNKNOWN_PREIMAGE,
                payment_request: vec![0x02; 32],
            },
            1_700_000_000,
        )
    }

    #[tokio::test]
    async fn test_add_indexes_are_dense_and_increasing() {
        let store = MemInvoiceStore::new();
        for i in 1..=5u8 {
            let (invoice, hash) = make_invoice(Preimage([i; 32]), 1000);
            let add_index = store.add_invoice(invoice, hash).await.unwrap();
            assert_eq!(add_index, i as u64);
        }

        let backlog = store.invoices_added_since(2).await.unwrap();
        assert_eq!(backlog.len(), 3);
        assert_eq!(backlog[0].add_index, 3);
        assert_eq!(backlog[2].add_index, 5);
    }

    #[tokio::test]
    async fn test_duplicate_hash_rejected() {
        let store = MemInvoiceStore::new();
        let (invoice, hash) = make_invoice(Preimage([1; 32]), 1000);
        store.add_invoice(invoice.clone(), hash).await.unwrap();
        assert_eq!(
            store.add_invoice(invoice, hash).await,
            Err(StoreError::DuplicateInvoice)
        );
    }

    #[tokio::test]
    async fn test_accept_or_settle_settles_known_preimage() {
        let store = MemInvoiceStore::new();
        let (invoice, hash) = make_invoice(Preimage([1; 32]), 100_000);
        store.add_invoice(invoice, hash).await.unwrap();

        let settled = store.accept_or_settle_invoice(&hash, 100_500).await.unwrap();
        assert_eq!(settled.state, InvoiceState::Settled);
        assert_eq!(settled.settle_index, 1);
        assert_eq!(settled.amt_paid_msat, 100_500);

        // Second acceptance is a conflict and leaves amt_paid untouched.
        assert_eq!(
            store.accept_or_settle_invoice(&hash, 200_000).await,
            Err(StoreError::AlreadySettled)
        );
        let looked_up = store.lookup_invoice(&hash).await.unwrap();
        assert_eq!(looked_up.amt_paid_msat, 100_500);
    }

    #[tokio::test]
    async fn test_hold_invoice_accepts_then_settles() {
        let store = MemInvoiceStore::new();
        let preimage = Preimage([9; 32]);
        let hash = preimage.payment_hash();
        store.add_invoice(hold_invoice(hash, 100_000), hash).await.unwrap();

        let accepted = store.accept_or_settle_invoice(&hash, 100_500).await.unwrap();
        assert_eq!(accepted.state, InvoiceState::Accepted);
        assert_eq!(accepted.settle_index, 0);

        assert_eq!(
            store.accept_or_settle_invoice(&hash, 100_500).await,
            Err(StoreError::AlreadyAccepted)
        );

        let settled = store.settle_hold_invoice(preimage).await.unwrap();
        assert_eq!(settled.state, InvoiceState::Settled);
        assert_eq!(settled.terms.preimage, preimage);
        assert_eq!(settled.settle_index, 1);

        assert_eq!(
            store.settle_hold_invoice(preimage).await,
            Err(StoreError::AlreadySettled)
        );
    }

    #[tokio::test]
    async fn test_settle_hold_requires_accepted_state() {
        let store = MemInvoiceStore::new();
        let preimage = Preimage([3; 32]);
        let hash = preimage.payment_hash();
        store.add_invoice(hold_invoice(hash, 1000), hash).await.unwrap();

        assert_eq!(
            store.settle_hold_invoice(preimage).await,
            Err(StoreError::UnexpectedState(InvoiceState::Open))
        );
    }

    #[tokio::test]
    async fn test_cancel_paths() {
        let store = MemInvoiceStore::new();
        let (invoice, hash) = make_invoice(Preimage([4; 32]), 1000);
        store.add_invoice(invoice, hash).await.unwrap();

        let canceled = store.cancel_invoice(&hash).await.unwrap();
        assert_eq!(canceled.state, InvoiceState::Canceled);
        assert_eq!(
            store.cancel_invoice(&hash).await,
            Err(StoreError::AlreadyCanceled)
        );

        // Accepting a canceled invoice reports the cancellation.
        assert_eq!(
            store.accept_or_settle_invoice(&hash, 1000).await,
            Err(StoreError::AlreadyCanceled)
        );
    }

    #[tokio::test]
    async fn test_settled_since_only_returns_settled() {
        let store = MemInvoiceStore::new();
        let (a, hash_a) = make_invoice(Preimage([1; 32]), 1000);
        let (b, hash_b) = make_invoice(Preimage([2; 32]), 2000);
        store.add_invoice(a, hash_a).await.unwrap();
        store.add_invoice(b, hash_b).await.unwrap();

        store.accept_or_settle_invoice(&hash_b, 2000).await.unwrap();

        let settled = store.invoices_settled_since(0).await.unwrap();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].hash, hash_b);
        assert_eq!(settled[0].settle_index, 1);

        assert!(store.invoices_settled_since(1).await.unwrap().is_empty());
    }
}
