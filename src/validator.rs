//! Divergence scanner.
//!
//! Two independent scans run concurrently:
//! - base -> target walks base one row at a time in key order and looks the
//!   row up in target, emitting `TargetMissing` or `NotEqual`;
//! - target -> base walks target in pages of identifiers, asks base which of
//!   them exist, and emits `BaseMissing` for the rest.
//!
//! Both scans resume strictly after the last key they saw (identifier in full
//! mode, `(marker, identifier)` in incremental mode), so rows inserted or
//! deleted mid-scan never shift a page boundary.
//!
//! Row-level failures are logged and skipped. Failing to read the next key
//! at all is retried with a short backoff; only a run of such failures ends
//! the scan with an error.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::EventChannel;
use crate::event::{Direction, EventKind, InconsistentEvent, DEFAULT_TOPIC};
use crate::record::Record;
use crate::store::{bounded, Lookup, RecordStore, ScanFilter, ScanKey};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Visit every row.
    Full,
    /// Visit rows modified after `since_ms`.
    Incremental { since_ms: i64 },
}

impl ScanMode {
    fn filter(&self) -> ScanFilter {
        match self {
            ScanMode::Full => ScanFilter::All,
            ScanMode::Incremental { since_ms } => ScanFilter::ModifiedAfter(*since_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Identifiers per page in the target -> base scan.
    pub batch_size: usize,
    pub mode: ScanMode,
    /// Incremental mode only: zero stops once caught up, anything else is the
    /// pause before polling again.
    pub idle_sleep: Duration,
    /// Budget for every single store or publish call.
    pub op_timeout: Duration,
    pub max_consecutive_errors: u32,
    pub retry_backoff: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            mode: ScanMode::Full,
            idle_sleep: Duration::ZERO,
            op_timeout: Duration::from_secs(1),
            max_consecutive_errors: 5,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub direction: Direction,
    /// Rows (forward) or identifiers (reverse) visited.
    pub scanned: u64,
    /// Events published.
    pub emitted: u64,
    pub row_errors: u64,
    pub publish_errors: u64,
}

impl ScanReport {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            scanned: 0,
            emitted: 0,
            row_errors: 0,
            publish_errors: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub base_to_target: ScanReport,
    pub target_to_base: ScanReport,
}

impl ValidationReport {
    pub fn emitted(&self) -> u64 {
        self.base_to_target.emitted + self.target_to_base.emitted
    }
}

pub struct Validator<T: Record> {
    base: Arc<dyn RecordStore<T>>,
    target: Arc<dyn RecordStore<T>>,
    channel: Arc<dyn EventChannel>,
    topic: Arc<str>,
    config: ValidatorConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<T: Record> Clone for Validator<T> {
    fn clone(&self) -> Self {
        Self {
            base: Arc::clone(&self.base),
            target: Arc::clone(&self.target),
            channel: Arc::clone(&self.channel),
            topic: Arc::clone(&self.topic),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T: Record> Validator<T> {
    pub fn new(
        base: Arc<dyn RecordStore<T>>,
        target: Arc<dyn RecordStore<T>>,
        channel: Arc<dyn EventChannel>,
    ) -> Self {
        Self {
            base,
            target,
            channel,
            topic: Arc::from(DEFAULT_TOPIC),
            config: ValidatorConfig::default(),
            shutdown: None,
        }
    }

    pub fn with_topic(mut self, topic: &str) -> Self {
        self.topic = Arc::from(topic);
        self
    }

    pub fn with_config(mut self, config: ValidatorConfig) -> Self {
        self.config = config;
        self.config.batch_size = self.config.batch_size.max(1);
        self
    }

    pub fn with_mode(mut self, mode: ScanMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.config.idle_sleep = idle_sleep;
        self
    }

    /// Stop scanning once `true` is sent. In-flight calls finish under their
    /// own timeout.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Run both directions as separate tasks and wait for both. The first
    /// error (forward direction first) wins.
    pub async fn validate(&self) -> AppResult<ValidationReport> {
        let forward = {
            let validator = self.clone();
            tokio::spawn(async move { validator.validate_base_to_target().await })
        };
        let reverse = {
            let validator = self.clone();
            tokio::spawn(async move { validator.validate_target_to_base().await })
        };
        let (forward, reverse) = tokio::join!(forward, reverse);
        let base_to_target = forward.map_err(task_failed)??;
        let target_to_base = reverse.map_err(task_failed)??;
        Ok(ValidationReport {
            base_to_target,
            target_to_base,
        })
    }

    pub async fn validate_base_to_target(&self) -> AppResult<ScanReport> {
        let direction = Direction::BaseToTarget;
        let filter = self.config.mode.filter();
        let timeout = self.config.op_timeout;
        let mut report = ScanReport::new(direction);
        let mut cursor: Option<ScanKey> = None;
        let mut failures = 0u32;

        info!(target: "dualmigrate", event = "validate_start", direction = %direction, mode = ?self.config.mode);
        loop {
            if self.cancelled() {
                info!(target: "dualmigrate", event = "validate_cancelled", direction = %direction);
                break;
            }

            let next = match bounded(timeout, "base.next_row", self.base.next_row(filter, cursor)).await {
                Ok(next) => {
                    failures = 0;
                    next
                }
                Err(err) => {
                    failures += 1;
                    self.scan_failure(direction, failures, err)?;
                    self.pause(self.config.retry_backoff).await;
                    continue;
                }
            };

            let Some(row) = next else {
                if self.keeps_polling() {
                    self.pause(self.config.idle_sleep).await;
                    continue;
                }
                break;
            };

            cursor = Some(row.key);
            report.scanned += 1;
            let base_row = match row.record {
                Ok(record) => record,
                Err(err) => {
                    report.row_errors += 1;
                    warn!(
                        target: "dualmigrate",
                        event = "validate_row_failed",
                        direction = %direction,
                        id = row.key.id,
                        store = "base",
                        error = %err
                    );
                    continue;
                }
            };

            let id = base_row.identifier();
            match bounded(timeout, "target.find", self.target.find(id)).await {
                Ok(Lookup::NotFound) => {
                    self.emit(&mut report, id, EventKind::TargetMissing).await;
                }
                Ok(Lookup::Found(target_row)) => {
                    if !base_row.equivalent_to(&target_row) {
                        self.emit(&mut report, id, EventKind::NotEqual).await;
                    }
                }
                Err(err) => {
                    report.row_errors += 1;
                    warn!(
                        target: "dualmigrate",
                        event = "validate_row_failed",
                        direction = %direction,
                        id,
                        store = "target",
                        error = %err
                    );
                }
            }
        }

        self.log_done(&report);
        Ok(report)
    }

    pub async fn validate_target_to_base(&self) -> AppResult<ScanReport> {
        let direction = Direction::TargetToBase;
        let filter = self.config.mode.filter();
        let timeout = self.config.op_timeout;
        let batch_size = self.config.batch_size.max(1);
        let mut report = ScanReport::new(direction);
        let mut cursor: Option<ScanKey> = None;
        let mut failures = 0u32;

        info!(target: "dualmigrate", event = "validate_start", direction = %direction, mode = ?self.config.mode);
        loop {
            if self.cancelled() {
                info!(target: "dualmigrate", event = "validate_cancelled", direction = %direction);
                break;
            }

            let page = match bounded(
                timeout,
                "target.next_keys",
                self.target.next_keys(filter, cursor, batch_size),
            )
            .await
            {
                Ok(page) => {
                    failures = 0;
                    page
                }
                Err(err) => {
                    failures += 1;
                    self.scan_failure(direction, failures, err)?;
                    self.pause(self.config.retry_backoff).await;
                    continue;
                }
            };

            if page.is_empty() {
                if self.keeps_polling() {
                    self.pause(self.config.idle_sleep).await;
                    continue;
                }
                break;
            }

            cursor = page.last().copied();
            report.scanned += page.len() as u64;
            let ids: Vec<i64> = page.iter().map(|key| key.id).collect();

            match bounded(timeout, "base.existing_ids", self.base.existing_ids(&ids)).await {
                Ok(mut present) => {
                    present.sort_unstable();
                    for id in ids {
                        if present.binary_search(&id).is_err() {
                            self.emit(&mut report, id, EventKind::BaseMissing).await;
                        }
                    }
                }
                Err(err) => {
                    report.row_errors += ids.len() as u64;
                    warn!(
                        target: "dualmigrate",
                        event = "validate_page_failed",
                        direction = %direction,
                        first_id = ids.first().copied().unwrap_or_default(),
                        size = ids.len(),
                        error = %err
                    );
                }
            }

            if page.len() < batch_size && matches!(self.config.mode, ScanMode::Full) {
                break;
            }
        }

        self.log_done(&report);
        Ok(report)
    }

    async fn emit(&self, report: &mut ScanReport, id: i64, kind: EventKind) {
        let event = InconsistentEvent::new(id, kind, report.direction);
        debug!(
            target: "dualmigrate",
            event = "inconsistency_found",
            id,
            kind = %kind,
            direction = %report.direction
        );
        let published = match event.encode() {
            Ok(payload) => {
                bounded(
                    self.config.op_timeout,
                    "channel.publish",
                    self.channel.publish(&self.topic, &payload),
                )
                .await
            }
            Err(err) => Err(err),
        };
        match published {
            Ok(()) => report.emitted += 1,
            Err(err) => {
                report.publish_errors += 1;
                warn!(
                    target: "dualmigrate",
                    event = "inconsistency_publish_failed",
                    id,
                    kind = %kind,
                    direction = %report.direction,
                    error = %err
                );
            }
        }
    }

    fn scan_failure(&self, direction: Direction, failures: u32, err: AppError) -> AppResult<()> {
        warn!(
            target: "dualmigrate",
            event = "validate_scan_failed",
            direction = %direction,
            consecutive = failures,
            error = %err
        );
        if failures >= self.config.max_consecutive_errors.max(1) {
            return Err(err
                .with_context("direction", direction.as_str())
                .with_context("consecutive_failures", failures.to_string()));
        }
        Ok(())
    }

    fn log_done(&self, report: &ScanReport) {
        info!(
            target: "dualmigrate",
            event = "validate_done",
            direction = %report.direction,
            scanned = report.scanned,
            emitted = report.emitted,
            row_errors = report.row_errors,
            publish_errors = report.publish_errors
        );
    }

    fn keeps_polling(&self) -> bool {
        matches!(self.config.mode, ScanMode::Incremental { .. }) && !self.config.idle_sleep.is_zero()
    }

    fn cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn pause(&self, duration: Duration) {
        match &self.shutdown {
            None => tokio::time::sleep(duration).await,
            Some(rx) => {
                let mut rx = rx.clone();
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    changed = rx.changed() => {
                        // Sender gone: nobody can cancel any more, finish the pause.
                        if changed.is_err() {
                            tokio::time::sleep(duration).await;
                        }
                    }
                }
            }
        }
    }
}

fn task_failed(err: tokio::task::JoinError) -> AppError {
    AppError::new(AppError::TASK_FAILED, "validation task did not complete")
        .with_context("error", err.to_string())
}
