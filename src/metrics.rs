/// Metrics Module - Prometheus Instrumentation
///
/// All lnwatch instruments live on one registry:
/// - chain progress and notification dispatch counters
/// - active registration / subscription gauges
/// - invoice lifecycle counters

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ========================================================================
    // Chain progress
    // ========================================================================

    /// Height of the last connected block
    pub static ref CHAIN_TIP_HEIGHT: IntGauge = IntGauge::new(
        "lnwatch_chain_tip_height",
        "Height of the last connected block"
    ).unwrap();

    /// Blocks connected to the active chain
    pub static ref BLOCKS_CONNECTED: IntCounter = IntCounter::new(
        "lnwatch_blocks_connected_total",
        "Blocks connected to the active chain"
    ).unwrap();

    /// Blocks disconnected during reorgs
    pub static ref BLOCKS_DISCONNECTED: IntCounter = IntCounter::new(
        "lnwatch_blocks_disconnected_total",
        "Blocks disconnected during reorgs"
    ).unwrap();

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Confirmation notifications currently registered
    pub static ref CONF_NTFNS_ACTIVE: IntGauge = IntGauge::new(
        "lnwatch_conf_notifications_active",
        "Confirmation notifications currently registered"
    ).unwrap();

    /// Confirmation notifications dispatched
    pub static ref CONF_NTFNS_DISPATCHED: IntCounter = IntCounter::new(
        "lnwatch_conf_notifications_dispatched_total",
        "Confirmation notifications dispatched"
    ).unwrap();

    /// Negative-confirmation (reorg) events delivered
    pub static ref NEGATIVE_CONFS: IntCounter = IntCounter::new(
        "lnwatch_negative_confs_total",
        "Reorged confirmations reported to subscribers"
    ).unwrap();

    /// Spend notifications currently registered
    pub static ref SPEND_NTFNS_ACTIVE: IntGauge = IntGauge::new(
        "lnwatch_spend_notifications_active",
        "Spend notifications currently registered"
    ).unwrap();

    /// Spend notifications dispatched
    pub static ref SPEND_NTFNS_DISPATCHED: IntCounter = IntCounter::new(
        "lnwatch_spend_notifications_dispatched_total",
        "Spend notifications dispatched"
    ).unwrap();

    /// Connected block-epoch clients
    pub static ref EPOCH_CLIENTS: IntGauge = IntGauge::new(
        "lnwatch_epoch_clients",
        "Connected block-epoch clients"
    ).unwrap();

    // ========================================================================
    // Invoices
    // ========================================================================

    /// Invoices added
    pub static ref INVOICES_ADDED: IntCounter = IntCounter::new(
        "lnwatch_invoices_added_total",
        "Invoices added"
    ).unwrap();

    /// Invoices settled
    pub static ref INVOICES_SETTLED: IntCounter = IntCounter::new(
        "lnwatch_invoices_settled_total",
        "Invoices settled"
    ).unwrap();

    /// Invoices canceled
    pub static ref INVOICES_CANCELED: IntCounter = IntCounter::new(
        "lnwatch_invoices_canceled_total",
        "Invoices canceled"
    ).unwrap();

    /// Active invoice subscriptions
    /// Labels: kind (all, single)
    pub static ref INVOICE_SUBSCRIPTIONS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("lnwatch_invoice_subscriptions", "Active invoice subscriptions"),
        &["kind"]
    ).unwrap();
}

/// Register every instrument with the global registry. Call once at
/// startup; repeated registration errors are ignored.
pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(CHAIN_TIP_HEIGHT.clone()));
    let _ = REGISTRY.register(Box::new(BLOCKS_CONNECTED.clone()));
    let _ = REGISTRY.register(Box::new(BLOCKS_DISCONNECTED.clone()));
    let _ = REGISTRY.register(Box::new(CONF_NTFNS_ACTIVE.clone()));
    let _ = REGISTRY.register(Box::new(CONF_NTFNS_DISPATCHED.clone()));
    let _ = REGISTRY.register(Box::new(NEGATIVE_CONFS.clone()));
    let _ = REGISTRY.register(Box::new(SPEND_NTFNS_ACTIVE.clone()));
    let _ = REGISTRY.register(Box::new(SPEND_NTFNS_DISPATCHED.clone()));
    let _ = REGISTRY.register(Box::new(EPOCH_CLIENTS.clone()));
    let _ = REGISTRY.register(Box::new(INVOICES_ADDED.clone()));
    let _ = REGISTRY.register(Box::new(INVOICES_SETTLED.clone()));
    let _ = REGISTRY.register(Box::new(INVOICES_CANCELED.clone()));
    let _ = REGISTRY.register(Box::new(INVOICE_SUBSCRIPTIONS.clone()));
}

/// Render the registry in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
