//! Control plane for a running migration: switches the proxy's pattern and
//! owns at most one background validation job.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::pattern::{Pattern, PatternCell};
use crate::record::Record;
use crate::validator::{ScanMode, ValidationReport, Validator};
use crate::{AppError, AppResult};

struct ValidationJob {
    mode: ScanMode,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<AppResult<ValidationReport>>,
}

pub struct MigrationScheduler<T: Record> {
    pattern: Arc<PatternCell>,
    validator: Validator<T>,
    job: Mutex<Option<ValidationJob>>,
}

impl<T: Record> MigrationScheduler<T> {
    /// `pattern` is the proxy's cell (see `DualWritePool::pattern_handle`);
    /// `validator` is the template each job is cloned from.
    pub fn new(pattern: Arc<PatternCell>, validator: Validator<T>) -> Self {
        Self {
            pattern,
            validator,
            job: Mutex::new(None),
        }
    }

    pub fn pattern(&self) -> AppResult<Pattern> {
        self.pattern.load()
    }

    pub fn update_pattern(&self, name: &str) -> AppResult<Pattern> {
        let previous = self.pattern.update(name)?;
        info!(
            target: "dualmigrate",
            event = "pattern_updated",
            from = %previous,
            to = %name
        );
        Ok(previous)
    }

    pub async fn start_full(&self) -> AppResult<()> {
        self.start(ScanMode::Full, Duration::ZERO).await
    }

    pub async fn start_incremental(&self, since_ms: i64, idle_sleep: Duration) -> AppResult<()> {
        self.start(ScanMode::Incremental { since_ms }, idle_sleep).await
    }

    async fn start(&self, mode: ScanMode, idle_sleep: Duration) -> AppResult<()> {
        let mut slot = self.job.lock().await;
        if let Some(job) = slot.as_ref() {
            if !job.handle.is_finished() {
                return Err(AppError::new(
                    AppError::JOB_RUNNING,
                    "a validation job is already running",
                )
                .with_context("mode", format!("{:?}", job.mode)));
            }
        }

        let (shutdown, rx) = watch::channel(false);
        let validator = self
            .validator
            .clone()
            .with_mode(mode)
            .with_idle_sleep(idle_sleep)
            .with_shutdown(rx);
        let handle = tokio::spawn(async move { validator.validate().await });
        info!(target: "dualmigrate", event = "validation_job_started", mode = ?mode);
        *slot = Some(ValidationJob {
            mode,
            shutdown,
            handle,
        });
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.job
            .lock()
            .await
            .as_ref()
            .is_some_and(|job| !job.handle.is_finished())
    }

    /// Signal the current job to stop and wait for its report. `None` when no
    /// job was started.
    pub async fn stop(&self) -> Option<AppResult<ValidationReport>> {
        let job = self.job.lock().await.take()?;
        let _ = job.shutdown.send(true);
        let result = match job.handle.await {
            Ok(result) => result,
            Err(err) => Err(AppError::new(AppError::JOB_FAILED, "validation job did not complete")
                .with_context("error", err.to_string())),
        };
        info!(
            target: "dualmigrate",
            event = "validation_job_stopped",
            mode = ?job.mode,
            ok = result.is_ok()
        );
        Some(result)
    }
}
