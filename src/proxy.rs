//! Dual-write connection pool.
//!
//! [`DualWritePool`] stands in for a plain `SqlitePool` and fans every write
//! out to the base store, the target store, or both, according to the
//! [`Pattern`] in force when the call starts. Exactly one pattern snapshot is
//! taken per operation (or per transaction, at `begin`), so a concurrent
//! `update_pattern` never splits a single write across two phases.
//!
//! Writes to the two stores are never atomic together. The primary store's
//! outcome is the caller's outcome; a failure on the secondary store is
//! logged and swallowed, and the validator/fixer pair heals the drift later.

use std::convert::Infallible;
use std::sync::Arc;

use serde_json::Value;
use sqlx::sqlite::{SqliteQueryResult, SqliteRow};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, warn};

use crate::db::bind_args;
use crate::pattern::{Pattern, PatternCell, StoreRole};
use crate::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct DualWritePool {
    base: SqlitePool,
    target: SqlitePool,
    pattern: Arc<PatternCell>,
}

/// Options for [`DualWritePool::begin`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    /// Reject writes issued through the transaction.
    pub read_only: bool,
}

impl DualWritePool {
    /// Wrap two pools. Migration has not started yet, so the pattern begins
    /// at [`Pattern::SrcOnly`].
    pub fn new(base: SqlitePool, target: SqlitePool) -> Self {
        Self {
            base,
            target,
            pattern: Arc::new(PatternCell::default()),
        }
    }

    /// Start at `pattern` instead of [`Pattern::SrcOnly`].
    pub fn with_pattern(self, pattern: Pattern) -> Self {
        let _ = self.pattern.store(pattern);
        self
    }

    pub fn pattern(&self) -> AppResult<Pattern> {
        self.pattern.load()
    }

    /// Shared handle to the pattern cell, for a control plane living
    /// elsewhere in the host process.
    pub fn pattern_handle(&self) -> Arc<PatternCell> {
        Arc::clone(&self.pattern)
    }

    /// Switch migration phase. Only the four canonical names are accepted;
    /// anything else is rejected and the current pattern stays in effect.
    pub fn update_pattern(&self, name: &str) -> AppResult<()> {
        let previous = self.pattern.update(name)?;
        tracing::info!(
            target: "dualmigrate",
            event = "pattern_updated",
            from = %previous,
            to = %name
        );
        Ok(())
    }

    pub fn pool(&self, role: StoreRole) -> &SqlitePool {
        match role {
            StoreRole::Base => &self.base,
            StoreRole::Target => &self.target,
        }
    }

    pub async fn execute(&self, sql: &str, args: &[Value]) -> AppResult<SqliteQueryResult> {
        let pattern = self.pattern.load()?;
        let primary = pattern.primary();
        let result = bind_args(sql, args)
            .execute(self.pool(primary))
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("store", primary.as_str())
                    .with_context("pattern", pattern.as_str())
            })?;

        if let Some(secondary) = pattern.secondary() {
            if let Err(err) = bind_args(sql, args).execute(self.pool(secondary)).await {
                warn!(
                    target: "dualmigrate",
                    event = "dual_write_secondary_failed",
                    pattern = %pattern,
                    store = %secondary,
                    sql = %sql,
                    error = %err
                );
            }
        }
        Ok(result)
    }

    /// Reads come from exactly one store: the pattern's primary.
    pub async fn query(&self, sql: &str, args: &[Value]) -> AppResult<Vec<SqliteRow>> {
        let pattern = self.pattern.load()?;
        bind_args(sql, args)
            .fetch_all(self.pool(pattern.primary()))
            .await
            .map_err(AppError::from)
    }

    pub async fn query_row(&self, sql: &str, args: &[Value]) -> AppResult<Option<SqliteRow>> {
        let pattern = self.pattern.load()?;
        bind_args(sql, args)
            .fetch_optional(self.pool(pattern.primary()))
            .await
            .map_err(AppError::from)
    }

    /// Prepared statements would bind to a single backend, so they cannot be
    /// fanned out. Always rejected.
    pub fn prepare(&self, sql: &str) -> AppResult<Infallible> {
        Err(AppError::new(
            AppError::PREPARE_UNSUPPORTED,
            "prepared statements are not supported by the dual-write pool",
        )
        .with_context("sql", sql.to_string()))
    }

    /// Open the primary store's transaction, then the secondary's. Failing
    /// to open the secondary degrades the transaction to the primary only.
    pub async fn begin(&self, options: TxOptions) -> AppResult<DualWriteTx> {
        let pattern = self.pattern.load()?;
        let primary_role = pattern.primary();
        let primary = self.pool(primary_role).begin().await.map_err(|err| {
            AppError::from(err)
                .with_context("store", primary_role.as_str())
                .with_context("operation", "begin")
        })?;

        let secondary = match pattern.secondary() {
            None => None,
            Some(role) => match self.pool(role).begin().await {
                Ok(tx) => Some(tx),
                Err(err) => {
                    warn!(
                        target: "dualmigrate",
                        event = "dual_write_secondary_begin_failed",
                        pattern = %pattern,
                        store = %role,
                        error = %err
                    );
                    None
                }
            },
        };

        debug!(
            target: "dualmigrate",
            event = "dual_tx_begin",
            pattern = %pattern,
            degraded = pattern.secondary().is_some() && secondary.is_none()
        );

        Ok(DualWriteTx {
            pattern,
            options,
            primary,
            secondary,
        })
    }
}

/// Transaction bound to the pattern snapshot taken at `begin`. Dropping it
/// without committing rolls back both halves.
pub struct DualWriteTx {
    pattern: Pattern,
    options: TxOptions,
    primary: Transaction<'static, Sqlite>,
    secondary: Option<Transaction<'static, Sqlite>>,
}

impl DualWriteTx {
    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    /// False when the secondary half failed to open.
    pub fn is_dual(&self) -> bool {
        self.secondary.is_some()
    }

    pub async fn execute(&mut self, sql: &str, args: &[Value]) -> AppResult<SqliteQueryResult> {
        if self.options.read_only {
            return Err(AppError::new(
                AppError::READ_ONLY_TX,
                "write issued through a read-only transaction",
            )
            .with_context("sql", sql.to_string()));
        }

        let result = bind_args(sql, args)
            .execute(&mut *self.primary)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("store", self.pattern.primary().as_str())
                    .with_context("pattern", self.pattern.as_str())
            })?;

        if let (Some(tx), Some(role)) = (self.secondary.as_mut(), self.pattern.secondary()) {
            if let Err(err) = bind_args(sql, args).execute(&mut **tx).await {
                warn!(
                    target: "dualmigrate",
                    event = "dual_tx_secondary_exec_failed",
                    pattern = %self.pattern,
                    store = %role,
                    sql = %sql,
                    error = %err
                );
            }
        }
        Ok(result)
    }

    pub async fn query(&mut self, sql: &str, args: &[Value]) -> AppResult<Vec<SqliteRow>> {
        bind_args(sql, args)
            .fetch_all(&mut *self.primary)
            .await
            .map_err(AppError::from)
    }

    pub async fn query_row(&mut self, sql: &str, args: &[Value]) -> AppResult<Option<SqliteRow>> {
        bind_args(sql, args)
            .fetch_optional(&mut *self.primary)
            .await
            .map_err(AppError::from)
    }

    pub async fn commit(self) -> AppResult<()> {
        let DualWriteTx {
            pattern,
            primary,
            secondary,
            ..
        } = self;
        primary.commit().await.map_err(|err| {
            AppError::from(err)
                .with_context("store", pattern.primary().as_str())
                .with_context("operation", "commit")
        })?;
        if let Some(tx) = secondary {
            if let Err(err) = tx.commit().await {
                warn!(
                    target: "dualmigrate",
                    event = "dual_tx_secondary_commit_failed",
                    pattern = %pattern,
                    error = %err
                );
            }
        }
        debug!(target: "dualmigrate", event = "dual_tx_commit", pattern = %pattern);
        Ok(())
    }

    pub async fn rollback(self) -> AppResult<()> {
        let DualWriteTx {
            pattern,
            primary,
            secondary,
            ..
        } = self;
        primary.rollback().await.map_err(|err| {
            AppError::from(err)
                .with_context("store", pattern.primary().as_str())
                .with_context("operation", "rollback")
        })?;
        if let Some(tx) = secondary {
            if let Err(err) = tx.rollback().await {
                warn!(
                    target: "dualmigrate",
                    event = "dual_tx_secondary_rollback_failed",
                    pattern = %pattern,
                    error = %err
                );
            }
        }
        debug!(target: "dualmigrate", event = "dual_tx_rollback", pattern = %pattern);
        Ok(())
    }
}
