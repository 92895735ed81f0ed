use color_eyre::{eyre::eyre, Result};
use keeper_storage::{
    backup::{self, estimate_backup_size},
    BackupTrigger, StoreContents,
};

use crate::{app::App, cli::BackupCommand};

/// Execute a backup subcommand. `password` is only needed for create and restore.
pub async fn handle(cmd: BackupCommand, app: &App, password: Option<&str>) -> Result<()> {
    match cmd {
        BackupCommand::Create => {
            app.unlock(password).await?;
            let contents = StoreContents {
                patients: app.store.load_patients().await?,
                doctors: app.store.load_doctors().await?,
            };
            println!("Estimated size: {} bytes", estimate_backup_size(&contents)?);
            let backup = app
                .store
                .create_backup(&app.backups, BackupTrigger::Manual)
                .await?;
            println!("Created backup {} at {}", backup.id, backup.created_at);
        }
        BackupCommand::List => {
            let history = app.backups.history().await?;
            if history.is_empty() {
                println!("No backups yet. Create one with `keeper backup create`.");
                return Ok(());
            }
            for entry in history {
                println!(
                    "{} {} [{}] ~{} bytes",
                    entry.id, entry.timestamp, entry.trigger, entry.size_estimate
                );
            }
        }
        BackupCommand::Export { path, id } => {
            let backup = match id {
                Some(id) => app.backups.get_backup(id).await?,
                None => app
                    .backups
                    .latest_backup()
                    .await?
                    .ok_or_else(|| eyre!("no backups to export"))?,
            };
            backup::export_backup_to_file(&backup, &path)?;
            println!("Exported backup {} to {}", backup.id, path.display());
        }
        BackupCommand::Import { path } => {
            let backup = backup::import_backup_from_file(&path)?;
            let backup = app.backups.import_backup(backup).await?;
            println!("Imported backup {} from {}", backup.id, path.display());
        }
        BackupCommand::Restore { id } => {
            app.unlock(password).await?;
            let backup = app.backups.get_backup(id).await?;
            let restored = app.store.open_backup(&app.backups, &backup).await?;
            let (patients, doctors) = (restored.patients.len(), restored.doctors.len());
            app.store.commit_restore(restored).await?;
            println!("Restored {patients} patient(s) and {doctors} doctor(s) from {id}");
        }
    }
    Ok(())
}
