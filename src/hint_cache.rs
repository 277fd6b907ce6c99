/// Confirm-Hint Cache
///
/// Persists the latest scanned height per watched transaction so that a
/// restart can begin its historical rescan near the tip instead of at the
/// registration height. One atomic batch per tip change: a crash can never
/// leave some watched transactions hinted at the new height and others at
/// the old one.

use std::path::Path;
use std::sync::Arc;

use bitcoin::Txid;
use byteorder::{ByteOrder, LittleEndian};
use rocksdb::{Options, WriteBatch, DB};
use tracing::debug;

use crate::errors::HintCacheError;

const CF_CONF_HINTS: &str = "conf_hints";

/// Contract consumed by the confirmation notifier. Write failures are
/// logged by callers and never abort a tip transition.
pub trait ConfirmHintCache: Send + Sync {
    /// Record `height` as the latest scanned height for every txid, in
    /// one atomic write.
    fn commit_confirm_hint(&self, height: u32, txids: &[Txid]) -> Result<(), HintCacheError>;

    /// Latest scanned height for a txid, if one was ever committed.
    fn query_confirm_hint(&self, txid: &Txid) -> Result<u32, HintCacheError>;

    /// Drop the entries for transactions no longer watched.
    fn purge_confirm_hint(&self, txids: &[Txid]) -> Result<(), HintCacheError>;
}

/// RocksDB-backed hint cache. Keys are raw txid bytes in the
/// `conf_hints` column family; values are little-endian u32 heights.
pub struct RocksHintCache {
    db: Arc<DB>,
}

impl RocksHintCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, HintCacheError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, [CF_CONF_HINTS])
            .map_err(|e| HintCacheError::Backend(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, HintCacheError> {
        self.db
            .cf_handle(CF_CONF_HINTS)
            .ok_or_else(|| HintCacheError::Backend("conf_hints CF not found".to_string()))
    }
}

impl ConfirmHintCache for RocksHintCache {
    fn commit_confirm_hint(&self, height: u32, txids: &[Txid]) -> Result<(), HintCacheError> {
        if txids.is_empty() {
            return Ok(());
        }

        let cf = self.cf()?;
        let mut value = [0u8; 4];
        LittleEndian::write_u32(&mut value, height);

        let mut batch = WriteBatch::default();
        for txid in txids {
            batch.put_cf(cf, txid.into_inner(), value);
        }
        self.db
            .write(batch)
            .map_err(|e| HintCacheError::Backend(e.to_string()))?;

        debug!(height, txids = txids.len(), "committed confirm hints");
        Ok(())
    }

    fn query_confirm_hint(&self, txid: &Txid) -> Result<u32, HintCacheError> {
        let cf = self.cf()?;
        let value = self
            .db
            .get_cf(cf, txid.into_inner())
            .map_err(|e| HintCacheError::Backend(e.to_string()))?
            .ok_or(HintCacheError::NotFound)?;
        if value.len() != 4 {
            return Err(HintCacheError::Backend(format!(
                "malformed hint value of {} bytes",
                value.len()
            )));
        }
        Ok(LittleEndian::read_u32(&value))
    }

    fn purge_confirm_hint(&self, txids: &[Txid]) -> Result<(), HintCacheError> {
        if txids.is_empty() {
            return Ok(());
        }

        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for txid in txids {
            batch.delete_cf(cf, txid.into_inner());
        }
        self.db
            .write(batch)
            .map_err(|e| HintCacheError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use tempfile::TempDir;

    fn test_txid(byte: u8) -> Txid {
        Txid::from_slice(&[byte; 32]).unwrap()
    }

    fn open_cache() -> (RocksHintCache, TempDir) {
        let dir = TempDir::new().unwrap();
        let cache = RocksHintCache::open(dir.path()).unwrap();
        (cache, dir)
    }

    #[test]
    fn test_commit_and_query_hint() {
        let (cache, _dir) = open_cache();
        let txid = test_txid(1);

        cache.commit_confirm_hint(1000, &[txid]).unwrap();
        assert_eq!(cache.query_confirm_hint(&txid).unwrap(), 1000);

        // Later commits overwrite.
        cache.commit_confirm_hint(1001, &[txid]).unwrap();
        assert_eq!(cache.query_confirm_hint(&txid).unwrap(), 1001);
    }

    #[test]
    fn test_batched_commit_covers_all_txids() {
        let (cache, _dir) = open_cache();
        let txids: Vec<Txid> = (0..10).map(test_txid).collect();

        cache.commit_confirm_hint(500, &txids).unwrap();
        for txid in &txids {
            assert_eq!(cache.query_confirm_hint(txid).unwrap(), 500);
        }
    }

    #[test]
    fn test_query_unknown_txid() {
        let (cache, _dir) = open_cache();
        assert_eq!(
            cache.query_confirm_hint(&test_txid(9)),
            Err(HintCacheError::NotFound)
        );
    }

    #[test]
    fn test_purge_removes_hints() {
        let (cache, _dir) = open_cache();
        let keep = test_txid(1);
        let drop = test_txid(2);

        cache.commit_confirm_hint(42, &[keep, drop]).unwrap();
        cache.purge_confirm_hint(&[drop]).unwrap();

        assert_eq!(cache.query_confirm_hint(&keep).unwrap(), 42);
        assert_eq!(
            cache.query_confirm_hint(&drop),
            Err(HintCacheError::NotFound)
        );
    }

    #[test]
    fn test_empty_commit_is_noop() {
        let (cache, _dir) = open_cache();
        cache.commit_confirm_hint(7, &[]).unwrap();
    }
}
