#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use anyhow::Result;

use dualmigrate_lib::event::DEFAULT_TOPIC;
use dualmigrate_lib::pattern::{Pattern, StoreRole};
use dualmigrate_lib::proxy::DualWritePool;
use dualmigrate_lib::scheduler::MigrationScheduler;
use dualmigrate_lib::validator::Validator;
use dualmigrate_lib::AppError;

mod util;
use util::*;

#[tokio::test]
async fn pattern_switches_are_visible_to_the_proxy() -> Result<()> {
    let base = articles_pool().await;
    let target = articles_pool().await;
    let proxy = DualWritePool::new(base.clone(), target.clone());
    let validator = Validator::new(
        as_dyn(&article_store(&base)),
        as_dyn(&article_store(&target)),
        as_dyn_channel(&channel().await),
    );
    let scheduler = MigrationScheduler::new(proxy.pattern_handle(), validator);

    assert_eq!(scheduler.update_pattern("DstFirst")?, Pattern::SrcOnly);
    assert_eq!(proxy.pattern()?, Pattern::DstFirst);
    assert_eq!(proxy.pattern()?.primary(), StoreRole::Target);

    let err = scheduler.update_pattern("dst_only").unwrap_err();
    assert_eq!(err.code(), AppError::UNKNOWN_PATTERN);
    assert_eq!(scheduler.pattern()?, Pattern::DstFirst);
    Ok(())
}

#[tokio::test]
async fn incremental_job_runs_until_stopped() -> Result<()> {
    let base = articles_pool().await;
    let target = articles_pool().await;
    let channel = channel().await;
    let proxy = DualWritePool::new(base.clone(), target.clone());
    let validator = Validator::new(
        as_dyn(&article_store(&base)),
        as_dyn(&article_store(&target)),
        as_dyn_channel(&channel),
    );
    let scheduler = MigrationScheduler::new(proxy.pattern_handle(), validator);

    assert!(scheduler.stop().await.is_none());
    scheduler
        .start_incremental(1_000, Duration::from_millis(20))
        .await?;
    assert!(scheduler.is_running().await);

    let err = scheduler.start_full().await.unwrap_err();
    assert_eq!(err.code(), AppError::JOB_RUNNING);

    // Written after the job started and inside its window.
    insert(&base, &Article::new(7, "late", "row", 5_000)).await;
    tokio::time::timeout(Duration::from_secs(10), async {
        while channel.pending_count(DEFAULT_TOPIC).await? == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await??;

    let report = scheduler.stop().await.expect("job was started")?;
    assert_eq!(report.base_to_target.emitted, 1);
    assert!(!scheduler.is_running().await);
    assert!(scheduler.stop().await.is_none());
    Ok(())
}

#[tokio::test]
async fn finished_job_can_be_replaced() -> Result<()> {
    let base = articles_pool().await;
    let target = articles_pool().await;
    insert_many(&base, 1..=5).await;
    let channel = channel().await;
    let validator = Validator::new(
        as_dyn(&article_store(&base)),
        as_dyn(&article_store(&target)),
        as_dyn_channel(&channel),
    );
    let scheduler =
        MigrationScheduler::new(DualWritePool::new(base, target).pattern_handle(), validator);

    scheduler.start_full().await?;
    tokio::time::timeout(Duration::from_secs(10), async {
        while scheduler.is_running().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    scheduler.start_full().await?;
    let report = scheduler.stop().await.expect("job was started")?;
    // Stopping may land before or after the scan finishes.
    assert!(report.base_to_target.emitted <= 5);
    assert!(channel.pending_count(DEFAULT_TOPIC).await? >= 5);
    Ok(())
}
