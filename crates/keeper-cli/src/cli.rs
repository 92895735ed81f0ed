use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use uuid::Uuid;

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "keeper",
    about = "Encrypted, offline-first family health records",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Store password. Prefer the environment variable over the flag.
    #[arg(long, env = "KEEPER_PASSWORD", global = true, hide_env_values = true)]
    pub password: Option<String>,

    /// Treat the network as unavailable; mutations are only queued.
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print version and exit.
    Version,
    /// Check that the data directory is usable.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Manage patients.
    #[command(subcommand)]
    Patient(PatientCommand),
    /// Manage doctors.
    #[command(subcommand)]
    Doctor(DoctorCommand),
    /// Rotate the store password.
    #[command(subcommand)]
    Password(PasswordCommand),
    /// Create, list, export, import and restore backups.
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Inspect and drive the offline sync queue.
    #[command(subcommand)]
    Sync(SyncCommand),
    /// Show recent audit entries.
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Decrypt and structurally check everything on disk.
    Verify,
    /// Show security and sync status.
    Status,
    /// Recover from a lockout.
    #[command(subcommand)]
    Lockout(LockoutCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum PatientCommand {
    Add {
        name: String,
        /// Date of birth (YYYY-MM-DD).
        #[arg(long)]
        dob: Option<NaiveDate>,
        #[arg(long)]
        blood_type: Option<String>,
        /// Repeatable.
        #[arg(long = "allergy")]
        allergies: Vec<String>,
    },
    List,
    Remove {
        id: Uuid,
    },
    /// Append a dated medical record to a patient.
    Record {
        patient: Uuid,
        title: String,
        /// Defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        doctor: Option<Uuid>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DoctorCommand {
    Add {
        name: String,
        #[arg(long)]
        specialty: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    List,
    Remove {
        id: Uuid,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum PasswordCommand {
    Change {
        #[arg(long = "new", env = "KEEPER_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum BackupCommand {
    Create,
    List,
    /// Write a backup to a portable JSON file (latest when no id is given).
    Export {
        path: PathBuf,
        #[arg(long)]
        id: Option<Uuid>,
    },
    /// Validate a backup file and add it to the history.
    Import {
        path: PathBuf,
    },
    /// Replace live data with the contents of a backup.
    Restore {
        id: Uuid,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    Status,
    Flush,
    /// Requeue operations that exhausted their retries.
    Retry,
    /// Drop failed operations, or everything with `--all`.
    Clear {
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum LockoutCommand {
    /// Clear a lockout once `security.lockout_cooldown_minutes` have passed.
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_health_subcommand() {
        let cli = Cli::try_parse_from(["keeper", "health"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Health);
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli = Cli::try_parse_from(["keeper", "config", "init"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Config(ConfigCommand::Init));
    }

    #[test]
    fn parses_patient_add_with_options() {
        let cli = Cli::try_parse_from([
            "keeper",
            "--password",
            "pw",
            "patient",
            "add",
            "Ada Lovelace",
            "--dob",
            "1815-12-10",
            "--allergy",
            "penicillin",
            "--allergy",
            "latex",
        ])
        .expect("parse should succeed");
        assert_eq!(cli.password.as_deref(), Some("pw"));
        assert_eq!(
            cli.command,
            Command::Patient(PatientCommand::Add {
                name: "Ada Lovelace".into(),
                dob: NaiveDate::from_ymd_opt(1815, 12, 10),
                blood_type: None,
                allergies: vec!["penicillin".into(), "latex".into()],
            })
        );
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["keeper", "sync", "flush", "--offline"])
            .expect("parse should succeed");
        assert!(cli.offline);
        assert_eq!(cli.command, Command::Sync(SyncCommand::Flush));
    }

    #[test]
    fn audit_limit_defaults() {
        let cli = Cli::try_parse_from(["keeper", "audit"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Audit { limit: 20 });
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(Cli::try_parse_from(["keeper", "patient", "remove", "not-a-uuid"]).is_err());
    }
}
