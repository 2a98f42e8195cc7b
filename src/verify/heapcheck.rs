//! Looks up every table row in the leaf fingerprint built during the walk.

use tracing::debug;

use super::bloom::BloomFilter;
use super::{CancelToken, HeapCheckSummary};
use crate::storage::btree::page::encode_leaf_record;
use crate::storage::heap::TableScanner;
use crate::types::{Corruption, CorruptionKind, Result, TxId};

const WEAK_MODE_HINT: &str =
    "Retrying verification using the strict (parent) check might provide a more specific error.";

/// Fails on the first row whose leaf record is certainly absent from `filter`.
///
/// Weak checks skip rows created at or after `horizon`: their leaf entries may
/// have been inserted into pages the walk had already passed.
pub(crate) fn verify_presence(
    index: &str,
    table: &dyn TableScanner,
    filter: &BloomFilter,
    horizon: TxId,
    strict: bool,
    cancel: &CancelToken,
) -> Result<HeapCheckSummary> {
    if strict {
        debug!(target: "idxcheck::verify::heapcheck", table = table.name(), "verifying presence of all required tuples in index");
    } else {
        debug!(
            target: "idxcheck::verify::heapcheck",
            table = table.name(),
            "verifying presence of required tuples in index with creator before {horizon}"
        );
    }

    let mut present = 0u64;
    let mut skipped = 0u64;
    let mut record = Vec::new();
    table.scan(&mut |row| {
        cancel.check()?;
        if !strict && row.created_by >= horizon {
            skipped += 1;
            return Ok(());
        }
        record.clear();
        encode_leaf_record(&row.key, row.row, &mut record)?;
        if filter.lacks(&record) {
            let mut corruption = Corruption::new(
                CorruptionKind::HeapTupleMissing,
                index,
                format!(
                    "heap tuple {} from table \"{}\" lacks matching index tuple within index \"{index}\"",
                    row.row,
                    table.name()
                ),
            );
            if !strict {
                corruption = corruption.with_hint(WEAK_MODE_HINT);
            }
            return Err(corruption.into());
        }
        present += 1;
        Ok(())
    })?;

    let proportion = filter.proportion_bits_set();
    debug!(
        target: "idxcheck::verify::heapcheck",
        present,
        skipped,
        "finished verifying presence of {present} tuples (proportion of bits set: {proportion:.6}) from table \"{}\"",
        table.name()
    );
    Ok(HeapCheckSummary {
        table: table.name().to_owned(),
        rows_present: present,
        rows_skipped: skipped,
        bloom_bits: filter.bit_count(),
        bloom_hash_funcs: filter.hash_funcs(),
        proportion_bits_set: proportion,
    })
}
