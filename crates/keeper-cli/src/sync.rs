use color_eyre::Result;
use keeper_sync::{queue::SkipReason, SyncError};
use tracing::info;

use crate::{app::App, cli::SyncCommand};

/// Execute a sync subcommand. None of these need the store password.
pub async fn handle(cmd: SyncCommand, app: &App) -> Result<()> {
    match cmd {
        SyncCommand::Status => {
            let status = app.queue.refresh_status().await?;
            let estimate = app.queue.storage_estimate().await?;
            println!(
                "{} | pending: {} | failed: {}",
                if status.is_online { "online" } else { "offline" },
                status.pending_count,
                status.failed_count
            );
            if let Some(at) = status.last_sync_at {
                println!("last sync: {at}");
            }
            println!(
                "storage: {} of {} bytes used ({:.1}%)",
                estimate.used,
                estimate.quota,
                estimate.usage_ratio() * 100.0
            );
            for op in app.queue.failed_operations().await? {
                println!(
                    "failed: {} {:?} {}/{} after {} attempts: {}",
                    op.id,
                    op.op_type,
                    op.entity,
                    op.entity_id,
                    op.retry_count,
                    op.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        SyncCommand::Flush => {
            if !app.queue.request_persistent_storage().await? {
                info!("storage persistence not granted");
            }
            let report = app.queue.sync_pending().await?;
            match report.skipped {
                Some(SkipReason::Offline) => println!("Offline; nothing sent."),
                Some(SkipReason::AlreadySyncing) => println!("A flush is already running."),
                None => println!(
                    "Sent {} of {} operation(s); {} will be retried.",
                    report.completed.len(),
                    report.attempted,
                    report.retried.len() + report.errored.len()
                ),
            }
            if let Err(SyncError::Exhausted { ids }) = report.into_result() {
                println!(
                    "{} operation(s) gave up; run `keeper sync retry` or `keeper sync clear`.",
                    ids.len()
                );
            }
        }
        SyncCommand::Retry => {
            let count = app.queue.retry_failed().await?;
            println!("Requeued {count} operation(s).");
            if count > 0 && app.queue.connectivity().is_online() {
                let report = app.queue.sync_pending().await?;
                println!("Sent {} operation(s).", report.completed.len());
            }
        }
        SyncCommand::Clear { all } => {
            if all {
                app.queue.clear_all().await?;
                println!("Cleared the sync queue.");
            } else {
                let count = app.queue.clear_failed().await?;
                println!("Dropped {count} failed operation(s).");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use keeper_sync::OperationType;
    use uuid::Uuid;

    use super::*;
    use crate::app::test_app;

    #[tokio::test]
    async fn flush_and_clear_while_offline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(dir.path()).await;
        app.record_change(OperationType::Create, "patient", Uuid::new_v4())
            .await
            .unwrap();

        handle(SyncCommand::Flush, &app).await.expect("flush");
        assert_eq!(app.queue.status().pending_count, 1);
        handle(SyncCommand::Status, &app).await.expect("status");

        handle(SyncCommand::Clear { all: true }, &app)
            .await
            .expect("clear");
        assert_eq!(app.queue.status().pending_count, 0);
    }

    #[tokio::test]
    async fn flush_when_back_online_sends_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_app(dir.path()).await;
        app.record_change(OperationType::Delete, "doctor", Uuid::new_v4())
            .await
            .unwrap();
        app.queue.connectivity().set_online(true);
        handle(SyncCommand::Flush, &app).await.expect("flush");
        assert!(app.queue.pending_operations().await.unwrap().is_empty());
    }
}
