//! Event channel between the validator and the fixer.
//!
//! Delivery is at-least-once. A polled message is leased to its consumer;
//! if the consumer neither acks nor nacks before the lease runs out, the
//! message becomes visible again. Messages that keep failing move to the
//! dead-letter state after `max_attempts`.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::time::now_ms;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub seq: i64,
    pub topic: String,
    pub payload: Vec<u8>,
    /// Failed handling attempts before this delivery.
    pub attempts: i64,
}

#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> AppResult<()>;

    /// Lease up to `max` pending messages of `topic`, oldest first.
    async fn poll(&self, topic: &str, max: usize) -> AppResult<Vec<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> AppResult<()>;

    /// Return a message for redelivery, or dead-letter it once it has used
    /// up its attempts.
    async fn nack(&self, delivery: &Delivery, reason: &str) -> AppResult<()>;

    /// Park a message that can never be handled.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> AppResult<()>;
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS migration_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    topic TEXT NOT NULL,
    payload BLOB NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    leased_until INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS migration_events_topic_state_idx
    ON migration_events(topic, state, seq);";

/// Durable channel stored in a `migration_events` table.
#[derive(Debug, Clone)]
pub struct SqliteChannel {
    pool: SqlitePool,
    lease: Duration,
    max_attempts: u32,
}

impl SqliteChannel {
    pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    /// Create the table if needed and return a channel over it.
    pub async fn open(pool: SqlitePool) -> AppResult<Self> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await.map_err(|err| {
            AppError::from(err).with_context("operation", "channel_schema")
        })?;
        Ok(Self {
            pool,
            lease: Self::DEFAULT_LEASE,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        })
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn pending_count(&self, topic: &str) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM migration_events WHERE topic = ? AND state = 'pending'",
        )
        .bind(topic)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn dead_letters(&self, topic: &str) -> AppResult<Vec<Delivery>> {
        let rows = sqlx::query(
            "SELECT seq, topic, payload, attempts FROM migration_events
             WHERE topic = ? AND state = 'dead' ORDER BY seq",
        )
        .bind(topic)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delivery_from_row).collect()
    }
}

fn delivery_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<Delivery> {
    Ok(Delivery {
        seq: row.try_get("seq")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        attempts: row.try_get("attempts")?,
    })
}

#[async_trait]
impl EventChannel for SqliteChannel {
    async fn publish(&self, topic: &str, payload: &[u8]) -> AppResult<()> {
        let now = now_ms();
        sqlx::query(
            "INSERT INTO migration_events (topic, payload, created_at, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(topic)
        .bind(payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|err| AppError::from(err).with_context("topic", topic.to_string()))?;
        Ok(())
    }

    async fn poll(&self, topic: &str, max: usize) -> AppResult<Vec<Delivery>> {
        let now = now_ms();
        let lease_until = now + self.lease.as_millis() as i64;
        let rows = sqlx::query(
            "UPDATE migration_events SET leased_until = ?
             WHERE seq IN (
                 SELECT seq FROM migration_events
                 WHERE topic = ? AND state = 'pending' AND leased_until <= ?
                 ORDER BY seq LIMIT ?
             )
             RETURNING seq, topic, payload, attempts",
        )
        .bind(lease_until)
        .bind(topic)
        .bind(now)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| AppError::from(err).with_context("topic", topic.to_string()))?;

        let mut deliveries = rows
            .iter()
            .map(delivery_from_row)
            .collect::<AppResult<Vec<_>>>()?;
        deliveries.sort_by_key(|d| d.seq);
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> AppResult<()> {
        sqlx::query("UPDATE migration_events SET state = 'done', updated_at = ? WHERE seq = ?")
            .bind(now_ms())
            .bind(delivery.seq)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, reason: &str) -> AppResult<()> {
        let dead = delivery.attempts + 1 >= i64::from(self.max_attempts);
        sqlx::query(
            "UPDATE migration_events
             SET attempts = attempts + 1,
                 leased_until = 0,
                 last_error = ?,
                 state = CASE WHEN attempts + 1 >= ? THEN 'dead' ELSE 'pending' END,
                 updated_at = ?
             WHERE seq = ?",
        )
        .bind(reason)
        .bind(i64::from(self.max_attempts))
        .bind(now_ms())
        .bind(delivery.seq)
        .execute(&self.pool)
        .await?;
        if dead {
            warn!(
                target: "dualmigrate",
                event = "channel_dead_letter",
                topic = %delivery.topic,
                seq = delivery.seq,
                attempts = delivery.attempts + 1,
                reason = %reason
            );
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE migration_events
             SET state = 'dead', last_error = ?, updated_at = ?
             WHERE seq = ?",
        )
        .bind(reason)
        .bind(now_ms())
        .bind(delivery.seq)
        .execute(&self.pool)
        .await?;
        info!(
            target: "dualmigrate",
            event = "channel_dead_letter",
            topic = %delivery.topic,
            seq = delivery.seq,
            reason = %reason
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn channel() -> SqliteChannel {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect sqlite::memory:");
        SqliteChannel::open(pool).await.unwrap()
    }

    #[tokio::test]
    async fn poll_returns_in_publish_order_and_leases() {
        let ch = channel().await;
        ch.publish("t", b"one").await.unwrap();
        ch.publish("t", b"two").await.unwrap();
        ch.publish("other", b"x").await.unwrap();

        let batch = ch.poll("t", 10).await.unwrap();
        let payloads: Vec<&[u8]> = batch.iter().map(|d| d.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"one".as_slice(), b"two".as_slice()]);

        // Leased messages are not handed out twice.
        assert!(ch.poll("t", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acked_messages_are_gone() {
        let ch = channel().await;
        ch.publish("t", b"one").await.unwrap();
        let batch = ch.poll("t", 10).await.unwrap();
        ch.ack(&batch[0]).await.unwrap();
        assert_eq!(ch.pending_count("t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_lease_redelivers() {
        let ch = channel().await.with_lease(Duration::from_millis(0));
        ch.publish("t", b"one").await.unwrap();
        assert_eq!(ch.poll("t", 10).await.unwrap().len(), 1);
        assert_eq!(ch.poll("t", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nack_retries_then_dead_letters() {
        let ch = channel().await.with_max_attempts(2);
        ch.publish("t", b"flaky").await.unwrap();

        let first = ch.poll("t", 1).await.unwrap().remove(0);
        ch.nack(&first, "boom").await.unwrap();

        let second = ch.poll("t", 1).await.unwrap().remove(0);
        assert_eq!(second.attempts, 1);
        ch.nack(&second, "boom again").await.unwrap();

        assert!(ch.poll("t", 1).await.unwrap().is_empty());
        let dead = ch.dead_letters("t").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
    }

    #[tokio::test]
    async fn dead_letter_is_immediate() {
        let ch = channel().await;
        ch.publish("t", b"poison").await.unwrap();
        let d = ch.poll("t", 1).await.unwrap().remove(0);
        ch.dead_letter(&d, "unknown event type").await.unwrap();
        assert_eq!(ch.pending_count("t").await.unwrap(), 0);
        assert_eq!(ch.dead_letters("t").await.unwrap().len(), 1);
    }
}
