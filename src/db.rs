use std::str::FromStr;

use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool};

use crate::record::blob_bytes;
use crate::{AppError, AppResult};

pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Open a pool for one side of the migration. `url` is any sqlx SQLite URL
/// (`sqlite://path/to/db.sqlite3`, `sqlite::memory:`).
pub async fn open_pool(url: &str, max_connections: u32) -> AppResult<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(url)
        .map_err(|err| AppError::from(err).with_context("url", url.to_string()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await
        .map_err(|err| AppError::from(err).with_context("url", url.to_string()))?;

    log_effective_pragmas(&pool, url).await;
    Ok(pool)
}

async fn log_effective_pragmas(pool: &SqlitePool, url: &str) {
    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    tracing::info!(
        target: "dualmigrate",
        event = "db_open",
        url = %url,
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0
    );
}

pub(crate) fn bind_value<'q>(q: SqliteQuery<'q>, v: &Value) -> SqliteQuery<'q> {
    match v {
        Value::Null => q.bind(Option::<i64>::None),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else if let Some(f) = n.as_f64() {
                q.bind(f)
            } else {
                q.bind(Option::<i64>::None)
            }
        }
        Value::Bool(b) => q.bind(*b as i64),
        Value::String(s) => q.bind(s.clone()),
        Value::Object(_) => match blob_bytes(v) {
            Some(bytes) => q.bind(bytes),
            None => q.bind(v.to_string()),
        },
        _ => q.bind(v.to_string()),
    }
}

/// Build a query with positional `?` arguments bound in order.
pub(crate) fn bind_args<'q>(sql: &'q str, args: &[Value]) -> SqliteQuery<'q> {
    args.iter()
        .fold(sqlx::query(sql), |query, arg| bind_value(query, arg))
}
