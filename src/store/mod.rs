//! Relational-store capability the validator and fixer need.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::record::Record;
use crate::{AppError, AppResult};

mod sqlite;

pub use sqlite::SqliteRecordStore;

/// Outcome of a lookup by identifier. Absence is a normal answer, kept apart
/// from genuine I/O failures which travel in the surrounding `AppResult`.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Found(row) => Some(row),
            Lookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

/// Position of a row in scan order. Scans resume strictly after a key, so
/// concurrent inserts or deletes cannot shift page boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScanKey {
    pub marker: i64,
    pub id: i64,
}

/// Which rows a scan visits and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFilter {
    /// Every row, ordered by identifier.
    All,
    /// Rows whose modification marker is newer than the watermark, ordered
    /// by `(marker, id)`.
    ModifiedAfter(i64),
}

/// One row produced by a forward scan. The key is always known; the record
/// itself may fail to decode, which only costs that row.
#[derive(Debug)]
pub struct ScanRow<T> {
    pub key: ScanKey,
    pub record: AppResult<T>,
}

#[async_trait]
pub trait RecordStore<T: Record>: Send + Sync {
    async fn find(&self, id: i64) -> AppResult<Lookup<T>>;

    /// The next row strictly after `after` (or the first row) under `filter`.
    async fn next_row(
        &self,
        filter: ScanFilter,
        after: Option<ScanKey>,
    ) -> AppResult<Option<ScanRow<T>>>;

    /// Up to `limit` keys strictly after `after` under `filter`.
    async fn next_keys(
        &self,
        filter: ScanFilter,
        after: Option<ScanKey>,
        limit: usize,
    ) -> AppResult<Vec<ScanKey>>;

    /// The subset of `ids` present in this store, in no particular order.
    async fn existing_ids(&self, ids: &[i64]) -> AppResult<Vec<i64>>;

    /// Insert, or overwrite every column when the identifier already exists.
    async fn upsert(&self, record: &T) -> AppResult<()>;

    /// Delete by identifier. Returns the number of rows removed.
    async fn delete(&self, id: i64) -> AppResult<u64>;
}

/// Bound a store or channel call by `limit`.
pub async fn bounded<F, R>(limit: Duration, operation: &str, fut: F) -> AppResult<R>
where
    F: Future<Output = AppResult<R>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::timeout(operation, limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_keys_order_by_marker_then_id() {
        let a = ScanKey { marker: 5, id: 9 };
        let b = ScanKey { marker: 6, id: 1 };
        let c = ScanKey { marker: 6, id: 2 };
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn bounded_maps_elapsed_to_timeout_error() {
        let err = bounded(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, AppError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), AppError::STORE_TIMEOUT);
        assert_eq!(err.context().get("operation"), Some(&"slow".to_string()));
    }

    #[test]
    fn lookup_converts_to_option() {
        assert_eq!(Lookup::Found(3).into_option(), Some(3));
        assert!(!Lookup::<i32>::NotFound.is_found());
    }
}
