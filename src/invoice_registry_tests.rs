//! Scenario tests for the invoice registry: the settle/cancel/hold
//! lifecycles end to end, subscriber streams with backlog replay, and
//! hodl channel bookkeeping.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::errors::{RegistryError, StoreError};
    use crate::invoice_registry::{HodlChan, InvoiceRegistry, StaticCltvDecoder};
    use crate::invoice_store::MemInvoiceStore;
    use crate::types::{
        HodlEvent, Invoice, InvoiceState, InvoiceTerms, PaymentHash, Preimage, UNKNOWN_PREIMAGE,
    };

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn new_registry() -> Arc<InvoiceRegistry> {
        let registry = Arc::new(InvoiceRegistry::new(
            Arc::new(MemInvoiceStore::new()),
            Arc::new(StaticCltvDecoder { delta: 40 }),
        ));
        registry.start();
        registry
    }

    fn test_invoice(preimage: Preimage, value_msat: u64) -> (Invoice, PaymentHash) {
        let hash = preimage.payment_hash();
        let invoice = Invoice::new(
            hash,
            InvoiceTerms {
                value_msat,
                preimage,
                payment_request: vec![0xab; 40],
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
                payment_request: vec![0xcd; 40],
            },
            1_700_000_000,
        )
    }

    async fn recv(rx: &mut mpsc::Receiver<Invoice>) -> Invoice {
        timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for invoice event")
            .expect("invoice stream closed")
    }

    async fn recv_hodl(rx: &mut mpsc::UnboundedReceiver<HodlEvent>) -> HodlEvent {
        timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for hodl event")
            .expect("hodl stream closed")
    }

    /// Let the dispatcher drain its subscription channel before events
    /// race it.
    async fn settle_dispatch() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_simple_settle() {
        let registry = new_registry();
        let mut all = registry.subscribe_notifications(0, 0).await.unwrap();
        settle_dispatch().await;

        let preimage = Preimage([1; 32]);
        let (invoice, hash) = test_invoice(preimage, 100_000);
        let add_index = registry.add_invoice(invoice, hash).await.unwrap();
        assert_eq!(add_index, 1);
        settle_dispatch().await;

        let mut single = registry.subscribe_single_invoice(hash).await.unwrap();
        settle_dispatch().await;

        // The snapshot backlog delivers the open invoice.
        let snapshot = recv(&mut single.updates).await;
        assert_eq!(snapshot.state, InvoiceState::Open);

        let opened = recv(&mut all.new_invoices).await;
        assert_eq!(opened.state, InvoiceState::Open);
        assert_eq!(opened.add_index, 1);

        let (hodl_chan, mut hodl_rx) = HodlChan::new();
        let event = registry
            .notify_exit_hop_htlc(hash, 100_500, &hodl_chan)
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(HodlEvent {
                hash,
                preimage: Some(preimage)
            })
        );

        let settled = recv(&mut single.updates).await;
        assert_eq!(settled.state, InvoiceState::Settled);
        assert_eq!(settled.amt_paid_msat, 100_500);

        let settled_global = recv(&mut all.settled_invoices).await;
        assert_eq!(settled_global.state, InvoiceState::Settled);
        assert_eq!(settled_global.settle_index, 1);

        // Settled invoices cannot be canceled.
        assert_eq!(
            registry.cancel_invoice(hash).await,
            Err(RegistryError::Store(StoreError::AlreadySettled))
        );

        // The resolution came back inline, never through the hodl chan.
        assert!(hodl_rx.try_recv().is_err());

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_settle_keeps_first_amount() {
        let registry = new_registry();
        let preimage = Preimage([2; 32]);
        let (invoice, hash) = test_invoice(preimage, 100_000);
        registry.add_invoice(invoice, hash).await.unwrap();

        let (hodl_chan, _hodl_rx) = HodlChan::new();
        registry
            .notify_exit_hop_htlc(hash, 100_500, &hodl_chan)
            .await
            .unwrap();

        // Replays succeed and return the canonical preimage.
        let second = registry
            .notify_exit_hop_htlc(hash, 100_500, &hodl_chan)
            .await
            .unwrap();
        assert_eq!(second.unwrap().preimage, Some(preimage));

        let third = registry
            .notify_exit_hop_htlc(hash, 101_100, &hodl_chan)
            .await
            .unwrap();
        assert_eq!(third.unwrap().preimage, Some(preimage));

        // The recorded amount is the first successful call's.
        let (looked_up, min_cltv) = registry.lookup_invoice(&hash).await.unwrap();
        assert_eq!(looked_up.amt_paid_msat, 100_500);
        assert_eq!(min_cltv, 40);

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_before_payment() {
        let registry = new_registry();
        let mut all = registry.subscribe_notifications(0, 0).await.unwrap();
        settle_dispatch().await;

        let preimage = Preimage([3; 32]);
        let (invoice, hash) = test_invoice(preimage, 50_000);
        registry.add_invoice(invoice, hash).await.unwrap();
        settle_dispatch().await;

        let mut single = registry.subscribe_single_invoice(hash).await.unwrap();
        settle_dispatch().await;

        registry.cancel_invoice(hash).await.unwrap();

        // The single subscriber sees the full path.
        assert_eq!(recv(&mut single.updates).await.state, InvoiceState::Open);
        assert_eq!(recv(&mut single.updates).await.state, InvoiceState::Canceled);

        // Global subscribers only ever see Open; no cancel event.
        assert_eq!(recv(&mut all.new_invoices).await.state, InvoiceState::Open);
        assert!(all.settled_invoices.try_recv().is_err());
        assert!(all.new_invoices.try_recv().is_err());

        // Cancel is idempotent.
        registry.cancel_invoice(hash).await.unwrap();

        // A late HTLC resolves straight to cancel, preimage-free.
        let (hodl_chan, mut hodl_rx) = HodlChan::new();
        let event = registry
            .notify_exit_hop_htlc(hash, 50_000, &hodl_chan)
            .await
            .unwrap();
        assert_eq!(event, Some(HodlEvent { hash, preimage: None }));
        assert!(hodl_rx.try_recv().is_err());

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_hold_invoice_lifecycle() {
        let registry = new_registry();
        let mut all = registry.subscribe_notifications(0, 0).await.unwrap();
        settle_dispatch().await;

        let preimage = Preimage([4; 32]);
        let hash = preimage.payment_hash();
        registry
            .add_invoice(hold_invoice(hash, 100_000), hash)
            .await
            .unwrap();
        settle_dispatch().await;

        let mut single = registry.subscribe_single_invoice(hash).await.unwrap();
        settle_dispatch().await;
        assert_eq!(recv(&mut single.updates).await.state, InvoiceState::Open);

        // The HTLC is held: no resolution yet, the chan is parked.
        let (hodl_chan, mut hodl_rx) = HodlChan::new();
        let held = registry
            .notify_exit_hop_htlc(hash, 100_500, &hodl_chan)
            .await
            .unwrap();
        assert_eq!(held, None);

        let accepted = recv(&mut single.updates).await;
        assert_eq!(accepted.state, InvoiceState::Accepted);
        assert_eq!(accepted.amt_paid_msat, 100_500);

        // Replayed acceptance is idempotent.
        let held_again = registry
            .notify_exit_hop_htlc(hash, 100_500, &hodl_chan)
            .await
            .unwrap();
        assert_eq!(held_again, None);

        // Out-of-band settle releases the parked HTLC.
        registry.settle_hodl_invoice(preimage).await.unwrap();
        let resolution = recv_hodl(&mut hodl_rx).await;
        assert_eq!(resolution.preimage, Some(preimage));

        assert_eq!(recv(&mut single.updates).await.state, InvoiceState::Settled);
        let settled_global = recv(&mut all.settled_invoices).await;
        assert_eq!(settled_global.state, InvoiceState::Settled);

        // Terminal-state conflicts surface as typed errors.
        assert_eq!(
            registry.settle_hodl_invoice(preimage).await,
            Err(RegistryError::Store(StoreError::AlreadySettled))
        );
        assert_eq!(
            registry.cancel_invoice(hash).await,
            Err(RegistryError::Store(StoreError::AlreadySettled))
        );

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_hold_invoice_cancel_resolves_chans() {
        let registry = new_registry();
        let preimage = Preimage([5; 32]);
        let hash = preimage.payment_hash();
        registry
            .add_invoice(hold_invoice(hash, 70_000), hash)
            .await
            .unwrap();

        // Two parked HTLCs on the same hash.
        let (chan_a, mut rx_a) = HodlChan::new();
        let (chan_b, mut rx_b) = HodlChan::new();
        assert_eq!(
            registry.notify_exit_hop_htlc(hash, 70_000, &chan_a).await.unwrap(),
            None
        );
        assert_eq!(
            registry.notify_exit_hop_htlc(hash, 70_000, &chan_b).await.unwrap(),
            None
        );

        registry.cancel_invoice(hash).await.unwrap();

        // Each sink hears the cancel exactly once, then nothing more.
        assert_eq!(recv_hodl(&mut rx_a).await, HodlEvent { hash, preimage: None });
        assert_eq!(recv_hodl(&mut rx_b).await, HodlEvent { hash, preimage: None });
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_hodl_unsubscribe_all() {
        let registry = new_registry();
        let preimage = Preimage([6; 32]);
        let hash = preimage.payment_hash();
        registry
            .add_invoice(hold_invoice(hash, 70_000), hash)
            .await
            .unwrap();

        let (chan, mut rx) = HodlChan::new();
        assert_eq!(
            registry.notify_exit_hop_htlc(hash, 70_000, &chan).await.unwrap(),
            None
        );

        // Dropping the subscription before resolution: no event arrives.
        registry.hodl_unsubscribe_all(&chan);
        registry.settle_hodl_invoice(preimage).await.unwrap();
        assert!(rx.try_recv().is_err());

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_backlog_replay_from_indexes() {
        let registry = new_registry();

        // Three invoices, the second settled, before anyone subscribes.
        let preimages: Vec<Preimage> = (1..=3).map(|i| Preimage([i + 10; 32])).collect();
        let mut hashes = Vec::new();
        for preimage in &preimages {
            let (invoice, hash) = test_invoice(*preimage, 10_000);
            registry.add_invoice(invoice, hash).await.unwrap();
            hashes.push(hash);
        }
        let (hodl_chan, _hodl_rx) = HodlChan::new();
        registry
            .notify_exit_hop_htlc(hashes[1], 10_000, &hodl_chan)
            .await
            .unwrap();

        // Reconnect having durably processed add_index 1 and nothing
        // settled: the backlog replays adds 2..3 and the settlement.
        let mut sub = registry.subscribe_notifications(1, 0).await.unwrap();
        let first = recv(&mut sub.new_invoices).await;
        assert_eq!(first.add_index, 2);
        let second = recv(&mut sub.new_invoices).await;
        assert_eq!(second.add_index, 3);

        let replayed_settle = recv(&mut sub.settled_invoices).await;
        assert_eq!(replayed_settle.hash, hashes[1]);
        assert_eq!(replayed_settle.settle_index, 1);
        settle_dispatch().await;

        // Live events continue past the backlog.
        let (invoice, hash) = test_invoice(Preimage([99; 32]), 20_000);
        registry.add_invoice(invoice, hash).await.unwrap();
        let live = recv(&mut sub.new_invoices).await;
        assert_eq!(live.add_index, 4);
        assert_eq!(live.hash, hash);

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_single_subscription_snapshot_of_settled_invoice() {
        let registry = new_registry();
        let preimage = Preimage([20; 32]);
        let (invoice, hash) = test_invoice(preimage, 10_000);
        registry.add_invoice(invoice, hash).await.unwrap();

        let (hodl_chan, _hodl_rx) = HodlChan::new();
        registry
            .notify_exit_hop_htlc(hash, 10_000, &hodl_chan)
            .await
            .unwrap();

        // A late subscriber's first update is the settled snapshot.
        let mut single = registry.subscribe_single_invoice(hash).await.unwrap();
        let snapshot = recv(&mut single.updates).await;
        assert_eq!(snapshot.state, InvoiceState::Settled);
        assert_eq!(snapshot.amt_paid_msat, 10_000);

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_subscription_cancel_is_idempotent() {
        let registry = new_registry();
        let sub = registry.subscribe_notifications(0, 0).await.unwrap();
        settle_dispatch().await;

        sub.cancel().await;
        sub.cancel().await;

        // Events after cancellation never reach the dead subscription's
        // channels; delivery to live subscribers is unaffected.
        let mut live = registry.subscribe_notifications(0, 0).await.unwrap();
        settle_dispatch().await;
        let (invoice, hash) = test_invoice(Preimage([30; 32]), 10_000);
        registry.add_invoice(invoice, hash).await.unwrap();
        assert_eq!(recv(&mut live.new_invoices).await.hash, hash);

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_debug_invoice_short_circuits() {
        let registry = new_registry();
        let preimage = Preimage([40; 32]);
        let (invoice, hash) = test_invoice(preimage, 10_000);
        registry.add_debug_invoice(invoice);

        // Lookup hits the debug map with a zero expiry, and the HTLC
        // path settles from it without touching the store.
        let (looked_up, min_cltv) = registry.lookup_invoice(&hash).await.unwrap();
        assert_eq!(looked_up.hash, hash);
        assert_eq!(min_cltv, 0);

        let (hodl_chan, _hodl_rx) = HodlChan::new();
        let event = registry
            .notify_exit_hop_htlc(hash, 10_000, &hodl_chan)
            .await
            .unwrap();
        assert_eq!(event.unwrap().preimage, Some(preimage));

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_invoice_errors() {
        let registry = new_registry();
        let hash = Preimage([50; 32]).payment_hash();

        assert_eq!(
            registry.lookup_invoice(&hash).await.unwrap_err(),
            RegistryError::Store(StoreError::NotFound)
        );

        let (hodl_chan, _hodl_rx) = HodlChan::new();
        assert_eq!(
            registry
                .notify_exit_hop_htlc(hash, 1_000, &hodl_chan)
                .await
                .unwrap_err(),
            RegistryError::Store(StoreError::NotFound)
        );
        assert_eq!(
            registry.cancel_invoice(hash).await.unwrap_err(),
            RegistryError::Store(StoreError::NotFound)
        );

        registry.stop().await;
    }
}
