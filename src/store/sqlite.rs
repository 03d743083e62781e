use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};

use super::{Lookup, RecordStore, ScanFilter, ScanKey, ScanRow};
use crate::db::bind_value;
use crate::record::{SqlRecord, TableSpec};
use crate::{AppError, AppResult};

/// SQLite keeps the bound-parameter limit well above this.
const IN_CHUNK: usize = 500;

/// [`RecordStore`] over one table of a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore<T> {
    pool: SqlitePool,
    spec: Arc<TableSpec>,
    select_sql: String,
    upsert_sql: String,
    _row: PhantomData<fn() -> T>,
}

impl<T: SqlRecord> SqliteRecordStore<T> {
    pub fn new(pool: SqlitePool, spec: TableSpec) -> AppResult<Self> {
        spec.validate()?;
        let select_sql = format!("SELECT {} FROM {}", spec.column_list(), spec.name);
        let upsert_sql = build_upsert(&spec);
        Ok(Self {
            pool,
            spec: Arc::new(spec),
            select_sql,
            upsert_sql,
            _row: PhantomData,
        })
    }

    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode(&self, row: &SqliteRow) -> AppResult<T> {
        T::from_row(row, &self.spec).map_err(|err| {
            AppError::from(err)
                .with_context("table", self.spec.name.clone())
                .with_context("operation", "decode_row")
        })
    }

    fn key_of(&self, row: &SqliteRow) -> AppResult<ScanKey> {
        let id: i64 = row.try_get(self.spec.id_column.as_str())?;
        let marker: Option<i64> = row.try_get(self.spec.modified_column.as_str())?;
        Ok(ScanKey {
            marker: marker.unwrap_or(0),
            id,
        })
    }

    /// `WHERE ... ORDER BY ...` for a keyset scan, plus its integer args.
    fn scan_clause(&self, filter: ScanFilter, after: Option<ScanKey>) -> (String, Vec<i64>) {
        let id = &self.spec.id_column;
        let m = &self.spec.modified_column;
        match (filter, after) {
            (ScanFilter::All, None) => (format!("ORDER BY {id}"), Vec::new()),
            (ScanFilter::All, Some(key)) => {
                (format!("WHERE {id} > ? ORDER BY {id}"), vec![key.id])
            }
            (ScanFilter::ModifiedAfter(since), None) => (
                format!("WHERE {m} > ? ORDER BY {m}, {id}"),
                vec![since],
            ),
            (ScanFilter::ModifiedAfter(since), Some(key)) => (
                format!(
                    "WHERE {m} > ? AND ({m} > ? OR ({m} = ? AND {id} > ?)) ORDER BY {m}, {id}"
                ),
                vec![since, key.marker, key.marker, key.id],
            ),
        }
    }
}

fn build_upsert(spec: &TableSpec) -> String {
    let placeholders = vec!["?"; spec.columns.len()].join(", ");
    let updates: Vec<String> = spec
        .columns
        .iter()
        .filter(|c| **c != spec.id_column)
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({placeholders}) ON CONFLICT({}) {action}",
        spec.name,
        spec.column_list(),
        spec.id_column
    )
}

#[async_trait]
impl<T: SqlRecord> RecordStore<T> for SqliteRecordStore<T> {
    async fn find(&self, id: i64) -> AppResult<Lookup<T>> {
        let sql = format!("{} WHERE {} = ?", self.select_sql, self.spec.id_column);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("table", self.spec.name.clone())
                    .with_context("id", id.to_string())
            })?;
        match row {
            Some(row) => Ok(Lookup::Found(self.decode(&row)?)),
            None => Ok(Lookup::NotFound),
        }
    }

    async fn next_row(
        &self,
        filter: ScanFilter,
        after: Option<ScanKey>,
    ) -> AppResult<Option<ScanRow<T>>> {
        let (clause, args) = self.scan_clause(filter, after);
        let sql = format!("{} {clause} LIMIT 1", self.select_sql);
        let query = args
            .iter()
            .fold(sqlx::query(&sql), |q, arg| q.bind(*arg));
        let row = query.fetch_optional(&self.pool).await.map_err(|err| {
            AppError::from(err)
                .with_context("table", self.spec.name.clone())
                .with_context("operation", "next_row")
        })?;
        let Some(row) = row else {
            return Ok(None);
        };
        let key = self.key_of(&row)?;
        Ok(Some(ScanRow {
            key,
            record: self.decode(&row),
        }))
    }

    async fn next_keys(
        &self,
        filter: ScanFilter,
        after: Option<ScanKey>,
        limit: usize,
    ) -> AppResult<Vec<ScanKey>> {
        let (clause, args) = self.scan_clause(filter, after);
        let sql = format!(
            "SELECT {}, {} FROM {} {clause} LIMIT ?",
            self.spec.id_column, self.spec.modified_column, self.spec.name
        );
        let query = args
            .iter()
            .fold(sqlx::query(&sql), |q, arg| q.bind(*arg))
            .bind(limit as i64);
        let rows = query.fetch_all(&self.pool).await.map_err(|err| {
            AppError::from(err)
                .with_context("table", self.spec.name.clone())
                .with_context("operation", "next_keys")
        })?;
        rows.iter().map(|row| self.key_of(row)).collect()
    }

    async fn existing_ids(&self, ids: &[i64]) -> AppResult<Vec<i64>> {
        let mut found = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {id} FROM {table} WHERE {id} IN ({placeholders})",
                id = self.spec.id_column,
                table = self.spec.name
            );
            let query = chunk.iter().fold(sqlx::query_scalar::<Sqlite, i64>(&sql), |q, id| {
                q.bind(*id)
            });
            let mut rows = query.fetch_all(&self.pool).await.map_err(|err| {
                AppError::from(err)
                    .with_context("table", self.spec.name.clone())
                    .with_context("operation", "existing_ids")
            })?;
            found.append(&mut rows);
        }
        Ok(found)
    }

    async fn upsert(&self, record: &T) -> AppResult<()> {
        let values: Vec<Value> = record.column_values(&self.spec);
        let query = values
            .iter()
            .fold(sqlx::query(&self.upsert_sql), |q, v| bind_value(q, v));
        query.execute(&self.pool).await.map_err(|err| {
            AppError::from(err)
                .with_context("table", self.spec.name.clone())
                .with_context("id", record.identifier().to_string())
                .with_context("operation", "upsert")
        })?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> AppResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            self.spec.name, self.spec.id_column
        );
        let res = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("table", self.spec.name.clone())
                    .with_context("id", id.to_string())
                    .with_context("operation", "delete")
            })?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{JsonRow, Record};
    use sqlx::sqlite::SqlitePoolOptions;

    fn spec() -> TableSpec {
        TableSpec::new("articles", &["id", "title", "utime"]).with_ignored(&["utime"])
    }

    async fn store() -> SqliteRecordStore<JsonRow> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect sqlite::memory:");
        sqlx::query("CREATE TABLE articles (id INTEGER PRIMARY KEY, title TEXT, utime INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        for (id, title, utime) in [(1, "a", 30), (2, "b", 10), (3, "c", 20), (4, "d", 10)] {
            sqlx::query("INSERT INTO articles (id, title, utime) VALUES (?, ?, ?)")
                .bind(id)
                .bind(title)
                .bind(utime)
                .execute(&pool)
                .await
                .unwrap();
        }
        SqliteRecordStore::new(pool, spec()).unwrap()
    }

    #[test]
    fn upsert_sql_updates_every_non_id_column() {
        assert_eq!(
            build_upsert(&spec()),
            "INSERT INTO articles (id, title, utime) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, utime = excluded.utime"
        );
    }

    #[tokio::test]
    async fn find_distinguishes_absent_rows() {
        let store = store().await;
        let found = store.find(2).await.unwrap();
        assert!(found.is_found());
        assert_eq!(store.find(99).await.unwrap(), Lookup::NotFound);
    }

    #[tokio::test]
    async fn full_scan_walks_ids_in_order() {
        let store = store().await;
        let mut after = None;
        let mut seen = Vec::new();
        while let Some(row) = store.next_row(ScanFilter::All, after).await.unwrap() {
            seen.push(row.record.unwrap().identifier());
            after = Some(row.key);
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn incremental_keys_order_by_marker_then_id() {
        let store = store().await;
        let keys = store
            .next_keys(ScanFilter::ModifiedAfter(5), None, 10)
            .await
            .unwrap();
        let ids: Vec<i64> = keys.iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![2, 4, 3, 1]);

        let rest = store
            .next_keys(ScanFilter::ModifiedAfter(5), Some(keys[1]), 10)
            .await
            .unwrap();
        let ids: Vec<i64> = rest.iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![3, 1]);

        let newer = store
            .next_keys(ScanFilter::ModifiedAfter(15), None, 10)
            .await
            .unwrap();
        assert_eq!(newer.len(), 2);
    }

    #[tokio::test]
    async fn existing_ids_returns_only_present_ids() {
        let store = store().await;
        let mut ids = store.existing_ids(&[4, 5, 1, 8]).await.unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 4]);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_delete_reports_rows() {
        let store = store().await;
        let Lookup::Found(mut row) = store.find(1).await.unwrap() else {
            panic!("row 1 missing");
        };
        let mut values = row.values().clone();
        values.insert("title".into(), Value::from("changed"));
        row = JsonRow::new(1, values, &spec().ignored_columns);
        store.upsert(&row).await.unwrap();
        store.upsert(&row).await.unwrap();
        let Lookup::Found(stored) = store.find(1).await.unwrap() else {
            panic!("row 1 missing after upsert");
        };
        assert!(stored.equivalent_to(&row));

        assert_eq!(store.delete(1).await.unwrap(), 1);
        assert_eq!(store.delete(1).await.unwrap(), 0);
    }
}
