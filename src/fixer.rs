//! Repairs the target store from the base store, one event at a time.
//!
//! Every repair is an upsert or a delete keyed by identifier, so handling
//! the same event twice, or two events for the same row in any order,
//! converges to the base store's current state.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{Delivery, EventChannel};
use crate::event::{EventKind, InconsistentEvent};
use crate::record::Record;
use crate::store::{bounded, Lookup, RecordStore};
use crate::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixOutcome {
    /// Target now holds base's current row.
    Upserted,
    /// Row removed from target (or was already absent).
    Deleted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FixerStats {
    pub fixed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

pub struct Fixer<T: Record> {
    base: Arc<dyn RecordStore<T>>,
    target: Arc<dyn RecordStore<T>>,
    op_timeout: Duration,
}

impl<T: Record> Clone for Fixer<T> {
    fn clone(&self) -> Self {
        Self {
            base: Arc::clone(&self.base),
            target: Arc::clone(&self.target),
            op_timeout: self.op_timeout,
        }
    }
}

impl<T: Record> Fixer<T> {
    pub fn new(base: Arc<dyn RecordStore<T>>, target: Arc<dyn RecordStore<T>>) -> Self {
        Self {
            base,
            target,
            op_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub async fn fix(&self, event: &InconsistentEvent) -> AppResult<FixOutcome> {
        let id = event.id;
        let outcome = match event.kind {
            EventKind::TargetMissing | EventKind::NotEqual => {
                match bounded(self.op_timeout, "base.find", self.base.find(id)).await? {
                    Lookup::Found(row) => {
                        bounded(self.op_timeout, "target.upsert", self.target.upsert(&row))
                            .await?;
                        FixOutcome::Upserted
                    }
                    // Deleted from base after the event was produced.
                    Lookup::NotFound => {
                        bounded(self.op_timeout, "target.delete", self.target.delete(id))
                            .await?;
                        FixOutcome::Deleted
                    }
                }
            }
            EventKind::BaseMissing => {
                bounded(self.op_timeout, "target.delete", self.target.delete(id)).await?;
                FixOutcome::Deleted
            }
        };
        debug!(
            target: "dualmigrate",
            event = "fix_applied",
            id,
            kind = %event.kind,
            direction = %event.direction,
            outcome = ?outcome
        );
        Ok(outcome)
    }

    /// Decode a raw channel payload and fix it. Malformed payloads and
    /// unknown kinds come back as `EVENT/*` errors.
    pub async fn handle(&self, payload: &[u8]) -> AppResult<FixOutcome> {
        let event = InconsistentEvent::decode(payload)?;
        self.fix(&event).await
    }

    /// Consume `topic` until `shutdown` flips to `true`.
    pub async fn run(
        &self,
        channel: Arc<dyn EventChannel>,
        topic: &str,
        batch: usize,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> AppResult<FixerStats> {
        let mut stats = FixerStats::default();
        info!(target: "dualmigrate", event = "fixer_start", topic = %topic);

        while !*shutdown.borrow() {
            let deliveries =
                match bounded(self.op_timeout, "channel.poll", channel.poll(topic, batch.max(1)))
                    .await
                {
                    Ok(deliveries) => deliveries,
                    Err(err) => {
                        warn!(target: "dualmigrate", event = "fixer_poll_failed", topic = %topic, error = %err);
                        Vec::new()
                    }
                };

            if deliveries.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            for delivery in deliveries {
                self.settle(channel.as_ref(), &delivery, &mut stats).await;
            }
        }

        info!(
            target: "dualmigrate",
            event = "fixer_stopped",
            topic = %topic,
            fixed = stats.fixed,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered
        );
        Ok(stats)
    }

    async fn settle(&self, channel: &dyn EventChannel, delivery: &Delivery, stats: &mut FixerStats) {
        let settled = match self.handle(&delivery.payload).await {
            Ok(_) => {
                stats.fixed += 1;
                bounded(self.op_timeout, "channel.ack", channel.ack(delivery)).await
            }
            Err(err) if err.is_poison_event() => {
                stats.dead_lettered += 1;
                warn!(
                    target: "dualmigrate",
                    event = "fix_rejected",
                    seq = delivery.seq,
                    error = %err
                );
                let reason = err.to_string();
                bounded(
                    self.op_timeout,
                    "channel.dead_letter",
                    channel.dead_letter(delivery, &reason),
                )
                .await
            }
            Err(err) => {
                stats.retried += 1;
                warn!(
                    target: "dualmigrate",
                    event = "fix_failed",
                    seq = delivery.seq,
                    attempts = delivery.attempts,
                    error = %err
                );
                let reason = err.to_string();
                bounded(self.op_timeout, "channel.nack", channel.nack(delivery, &reason)).await
            }
        };
        if let Err(err) = settled {
            // The lease runs out and the message comes back on its own.
            warn!(
                target: "dualmigrate",
                event = "fixer_settle_failed",
                seq = delivery.seq,
                error = %err
            );
        }
    }
}
