/// Core Notification & Invoice Types
///
/// Shared data model for both engines:
/// - Preimage / PaymentHash pair identifying an invoice
/// - Invoice terms, lifecycle states, monotonic indexes
/// - Confirmation, spend, block-epoch, and hold-event payloads

use std::fmt;

use bitcoin::{BlockHash, OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::telemetry::truncate_hex;

/// A 32-byte payment preimage. Revealing it releases the HTLC.
///
/// The all-zero value is the "unknown" sentinel used by hold invoices
/// whose preimage has not been revealed yet.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Preimage(pub [u8; 32]);

/// Sentinel marking a hold invoice with no known preimage.
pub const UNKNOWN_PREIMAGE: Preimage = Preimage([0u8; 32]);

impl Preimage {
    pub fn is_unknown(&self) -> bool {
        *self == UNKNOWN_PREIMAGE
    }

    /// SHA-256 digest of the preimage, identifying the invoice.
    pub fn payment_hash(&self) -> PaymentHash {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        let digest = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);
        PaymentHash(hash)
    }
}

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Preimage({})", truncate_hex(&hex::encode(self.0), 16))
    }
}

/// SHA-256 digest of a payment preimage. Primary invoice key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentHash(pub [u8; 32]);

impl fmt::Debug for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentHash({})", truncate_hex(&hex::encode(self.0), 16))
    }
}

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Invoice lifecycle state.
///
/// Valid transitions: Open -> {Accepted, Settled, Canceled},
/// Accepted -> {Settled, Canceled}; Settled and Canceled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceState {
    Open,
    Accepted,
    Settled,
    Canceled,
}

impl fmt::Display for InvoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvoiceState::Open => "open",
            InvoiceState::Accepted => "accepted",
            InvoiceState::Settled => "settled",
            InvoiceState::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// The payment contract of an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTerms {
    /// Invoice amount in millisatoshis.
    pub value_msat: u64,
    /// Payment preimage, or [`UNKNOWN_PREIMAGE`] for hold invoices.
    pub preimage: Preimage,
    /// Raw encoded payment request handed to the payer.
    pub payment_request: Vec<u8>,
}

/// A persistent invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub hash: PaymentHash,
    pub terms: InvoiceTerms,
    /// Creation time, unix seconds.
    pub creation_time: u64,
    pub state: InvoiceState,
    /// Monotonic index assigned by the store on insert. Strictly
    /// increasing across all invoices; 0 means unassigned.
    pub add_index: u64,
    /// Monotonic index assigned by the store on settlement. Strictly
    /// increasing across all settled invoices; 0 means unsettled.
    pub settle_index: u64,
    /// Amount actually paid, recorded by the first successful HTLC
    /// acceptance. Later accepts never change it.
    pub amt_paid_msat: u64,
}

impl Invoice {
    /// Fresh open invoice with unassigned indexes.
    pub fn new(hash: PaymentHash, terms: InvoiceTerms, creation_time: u64) -> Self {
        Self {
            hash,
            terms,
            creation_time,
            state: InvoiceState::Open,
            add_index: 0,
            settle_index: 0,
            amt_paid_msat: 0,
        }
    }
}

/// Where a watched transaction confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxConfirmation {
    pub block_hash: BlockHash,
    pub block_height: u32,
    /// Position of the transaction within its block.
    pub tx_index: u32,
}

/// Details of a watched outpoint being spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendDetail {
    pub spent_outpoint: OutPoint,
    pub spender_tx_hash: Txid,
    pub spender_input_index: u32,
    pub spending_height: u32,
}

/// A connect or disconnect event from the block source.
#[derive(Debug, Clone)]
pub struct FilteredBlock {
    pub hash: BlockHash,
    pub height: u32,
    /// Transactions of the block; empty for disconnects.
    pub txns: Vec<Transaction>,
    /// true for a block joining the chain, false for one leaving it.
    pub connect: bool,
}

/// A block joining the active chain, fanned out to epoch subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEpoch {
    pub hash: BlockHash,
    pub height: u32,
}

/// Resolution of a held HTLC: settle with the revealed preimage, or
/// cancel (no preimage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HodlEvent {
    pub hash: PaymentHash,
    /// Some = settle with this preimage, None = cancel back.
    pub preimage: Option<Preimage>,
}

/// Shorthand used by the notifier maps.
pub type ConfId = u64;
pub type SpendId = u64;
pub type EpochId = u64;
