use std::collections::HashMap;
use std::future::Future;

use rb_types::RankError;

use crate::types::{Transaction, TxnOutcome};

/// Key-value / ordered-index store the ranking layer is built on.
///
/// Methods use RPITIT (`-> impl Future + Send`) so generic callers can hold
/// the futures across `.await` on a multi-threaded runtime without an
/// `async-trait` dependency.
///
/// Expired keys are treated as absent by every read and write, whether or
/// not they have been physically purged yet.
pub trait RankStore: Send + Sync + 'static {
    /// Atomically increment the integer counter at `key` and return the new
    /// value. A missing counter starts at 0, so the first call returns 1.
    fn incr(&self, key: &str) -> impl Future<Output = Result<u64, RankError>> + Send;

    /// Apply a transaction atomically. If a guard is present it is evaluated
    /// first under the same critical section; when it fails nothing is
    /// written and `committed` is `false`.
    fn apply(&self, txn: Transaction)
        -> impl Future<Output = Result<TxnOutcome, RankError>> + Send;

    /// All fields of the hash at `key`, or `None` if absent.
    fn hash_fields(&self, key: &str)
        -> impl Future<Output = Result<Option<HashMap<String, String>>, RankError>> + Send;

    /// Cardinality of the set at `key` (0 when absent).
    fn set_len(&self, key: &str) -> impl Future<Output = Result<usize, RankError>> + Send;

    /// Value of `member` in the ordered index at `key`.
    fn score(&self, key: &str, member: &str)
        -> impl Future<Output = Result<Option<f64>, RankError>> + Send;

    /// Members at ranks `[start, stop]` (inclusive) in descending value order.
    /// Ties are broken by descending member name.
    fn range_desc(&self, key: &str, start: usize, stop: usize)
        -> impl Future<Output = Result<Vec<String>, RankError>> + Send;

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, RankError>> + Send;

    /// Physically drop every expired key. Returns how many were removed.
    fn purge_expired(&self) -> impl Future<Output = Result<usize, RankError>> + Send;
}
