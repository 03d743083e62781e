#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};

use dualmigrate_lib::channel::{EventChannel, SqliteChannel};
use dualmigrate_lib::record::{Record, SqlRecord, TableSpec};
use dualmigrate_lib::store::{RecordStore, SqliteRecordStore};

pub const ARTICLES_SQL: &str = "CREATE TABLE articles (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    utime INTEGER NOT NULL
)";

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

pub async fn articles_pool() -> SqlitePool {
    let pool = temp_pool().await;
    sqlx::query(ARTICLES_SQL).execute(&pool).await.unwrap();
    pool
}

/// Test row. `utime` is assigned by each store on its own and is left out
/// of equality.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub utime: i64,
}

impl Article {
    pub fn new(id: i64, title: &str, body: &str, utime: i64) -> Self {
        Self {
            id,
            title: title.into(),
            body: body.into(),
            utime,
        }
    }
}

impl Record for Article {
    fn identifier(&self) -> i64 {
        self.id
    }

    fn equivalent_to(&self, other: &Self) -> bool {
        self.id == other.id && self.title == other.title && self.body == other.body
    }
}

impl SqlRecord for Article {
    fn from_row(row: &SqliteRow, _spec: &TableSpec) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            body: row.try_get("body")?,
            utime: row.try_get("utime")?,
        })
    }

    fn column_values(&self, _spec: &TableSpec) -> Vec<Value> {
        vec![
            json!(self.id),
            json!(self.title),
            json!(self.body),
            json!(self.utime),
        ]
    }
}

pub fn articles_spec() -> TableSpec {
    TableSpec::new("articles", &["id", "title", "body", "utime"]).with_ignored(&["utime"])
}

pub fn article_store(pool: &SqlitePool) -> Arc<SqliteRecordStore<Article>> {
    Arc::new(SqliteRecordStore::new(pool.clone(), articles_spec()).unwrap())
}

pub fn as_dyn(store: &Arc<SqliteRecordStore<Article>>) -> Arc<dyn RecordStore<Article>> {
    store.clone()
}

pub async fn channel() -> Arc<SqliteChannel> {
    Arc::new(SqliteChannel::open(temp_pool().await).await.unwrap())
}

pub fn as_dyn_channel(channel: &Arc<SqliteChannel>) -> Arc<dyn EventChannel> {
    channel.clone()
}

pub async fn insert(pool: &SqlitePool, article: &Article) {
    sqlx::query("INSERT INTO articles (id, title, body, utime) VALUES (?, ?, ?, ?)")
        .bind(article.id)
        .bind(&article.title)
        .bind(&article.body)
        .bind(article.utime)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn insert_many(pool: &SqlitePool, ids: impl IntoIterator<Item = i64>) {
    let mut tx = pool.begin().await.unwrap();
    for id in ids {
        sqlx::query("INSERT INTO articles (id, title, body, utime) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(format!("title {id}"))
            .bind(format!("body {id}"))
            .bind(1_000 + id)
            .execute(&mut *tx)
            .await
            .unwrap();
    }
    tx.commit().await.unwrap();
}

pub async fn all_articles(pool: &SqlitePool) -> Vec<Article> {
    sqlx::query("SELECT id, title, body, utime FROM articles ORDER BY id")
        .fetch_all(pool)
        .await
        .unwrap()
        .iter()
        .map(|row| Article::from_row(row, &articles_spec()).unwrap())
        .collect()
}

/// Same ids and same compared values in both pools.
pub async fn assert_equivalent(base: &SqlitePool, target: &SqlitePool) {
    let base_rows = all_articles(base).await;
    let target_rows = all_articles(target).await;
    assert_eq!(
        base_rows.len(),
        target_rows.len(),
        "row count differs: base={base_rows:?} target={target_rows:?}"
    );
    for (b, t) in base_rows.iter().zip(target_rows.iter()) {
        assert!(b.equivalent_to(t), "rows differ: base={b:?} target={t:?}");
    }
}
