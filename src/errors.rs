/// Error Types
///
/// Every error kind callers are expected to pattern-match lives here.
/// Store conflict outcomes (already settled/canceled/accepted) are data,
/// not failures: the invoice paths branch on them to pick the HTLC
/// resolution, so they must stay distinguishable.

use thiserror::Error;

use crate::types::InvoiceState;

/// Errors surfaced by the chain notifier and the confirmation engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifierError {
    /// Any operation attempted after shutdown began.
    #[error("chain notifier is exiting")]
    Exiting,

    /// ConnectTip/DisconnectTip called with a non-adjacent height.
    /// No state is mutated when this is returned.
    #[error("out of order block: expected height {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },

    /// Unknown txid / confirmation id.
    #[error("no notification found for {0}")]
    NotFound(String),

    /// A confirmation registration with zero required confirmations.
    #[error("number of confirmations must be at least 1")]
    InvalidNumConfs,
}

/// Errors from the invoice store contract. Conflict variants double as
/// branch conditions for `notify_exit_hop_htlc`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("invoice already settled")]
    AlreadySettled,

    #[error("invoice already canceled")]
    AlreadyCanceled,

    #[error("invoice already accepted")]
    AlreadyAccepted,

    #[error("invoice not found")]
    NotFound,

    #[error("an invoice with this payment hash already exists")]
    DuplicateInvoice,

    /// The invoice is in a state the requested transition is not valid
    /// from (e.g. settling a hold invoice that is still open).
    #[error("unexpected invoice state: {0}")]
    UnexpectedState(InvoiceState),
}

/// Errors surfaced by the invoice registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invoice registry is shutting down")]
    Exiting,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("payment request decode failed: {0}")]
    Decode(String),
}

/// Height-hint cache failures. These are logged and never propagated out
/// of a tip transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HintCacheError {
    #[error("hint cache backend error: {0}")]
    Backend(String),

    #[error("no confirm hint recorded for transaction")]
    NotFound,
}

/// Errors from the light-client seam (block source, UTXO probe, filters).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LightClientError {
    #[error("light client backend error: {0}")]
    Backend(String),

    #[error("block not found: {0}")]
    BlockNotFound(String),
}
