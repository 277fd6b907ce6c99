//! lnwatch - chain-aware notification subsystem for a Lightning-style daemon
//!
//! Two engines share this crate:
//! - the chain notifier (per-tx confirmations, per-outpoint spends, block
//!   epochs) driven by connect/disconnect events from a block source
//! - the invoice registry (open/accepted/settled/canceled lifecycle,
//!   hold invoices, global and per-hash subscriber streams)
//!
//! Everything else (bitcoind driver, hint cache, config, telemetry, metrics)
//! is the scaffolding a running daemon needs around those two.

pub mod bitcoind_client;
pub mod chain_notifier;
pub mod conf_notifier;
pub mod config;
pub mod errors;
pub mod hint_cache;
pub mod invoice_registry;
pub mod invoice_store;
pub mod light_client;
pub mod metrics;
pub mod queue;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod invoice_registry_tests;
