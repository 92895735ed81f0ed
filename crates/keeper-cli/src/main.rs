mod app;
mod backup;
mod cli;
mod config;
mod records;
mod storage;
mod sync;

use chrono::Utc;
use clap::Parser;
use color_eyre::Result;
use keeper_core::cache::{Namespace, PersistentCache};
use keeper_storage::audit::Severity;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{
    app::App,
    cli::{Command, ConfigCommand, LockoutCommand, PasswordCommand},
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command {
        Command::Version => print_version(),
        Command::Health => run_health_check(&config).await?,
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        command => {
            let app = App::open(config, !cli.offline).await?;
            let result = dispatch(command, &app, cli.password.as_deref()).await;
            app.finish().await;
            result?
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("keeper {}", env!("CARGO_PKG_VERSION"));
}

async fn dispatch(command: Command, app: &App, password: Option<&str>) -> Result<()> {
    match command {
        Command::Patient(cmd) => {
            app.unlock(password).await?;
            records::handle_patient(cmd, app).await
        }
        Command::Doctor(cmd) => {
            app.unlock(password).await?;
            records::handle_doctor(cmd, app).await
        }
        Command::Password(PasswordCommand::Change { new_password }) => {
            let old = password.unwrap_or_default();
            app.unlock(password).await?;
            app.store.change_password(old, &new_password).await?;
            println!("Password changed.");
            Ok(())
        }
        Command::Backup(cmd) => backup::handle(cmd, app, password).await,
        Command::Sync(cmd) => sync::handle(cmd, app).await,
        Command::Audit { limit } => print_audit(app, limit).await,
        Command::Verify => {
            app.unlock(password).await?;
            if app.store.validate_data_integrity().await? {
                println!("Integrity: ok");
                Ok(())
            } else {
                color_eyre::eyre::bail!("stored data failed integrity checks")
            }
        }
        Command::Status => print_status(app).await,
        Command::Lockout(LockoutCommand::Reset) => {
            if app.store.reset_lockout_after_cooldown(Utc::now()).await? {
                println!("Lockout cleared.");
            } else {
                println!("Not locked.");
            }
            Ok(())
        }
        Command::Version | Command::Health | Command::Config(_) => Ok(()),
    }
}

/// Runs a quick health check of the data directory.
async fn run_health_check(config: &config::Config) -> Result<()> {
    let cache = storage::cache_from_config(config)?;
    run_cache_health(&cache).await?;
    println!("Storage: ok");
    Ok(())
}

async fn run_cache_health<C: PersistentCache>(cache: &C) -> Result<()> {
    let probe_key = "health_probe";
    let payload = b"ok";
    cache.put(Namespace::Settings, probe_key, payload).await?;
    let round_trip = cache.get(Namespace::Settings, probe_key).await?;
    cache.delete(Namespace::Settings, probe_key).await?;

    if round_trip != payload {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

async fn print_audit(app: &App, limit: usize) -> Result<()> {
    let entries = app.store.audit_log().recent(limit).await;
    if entries.is_empty() {
        println!("No audit entries.");
    }
    for entry in entries {
        let marker = if entry.severity >= Severity::High { "!" } else { " " };
        println!(
            "{marker} {} {:<24} {:?} {}",
            entry.timestamp, entry.action, entry.severity, entry.context
        );
    }
    Ok(())
}

async fn print_status(app: &App) -> Result<()> {
    let security = app.store.security_status().await;
    let sync = app.queue.refresh_status().await?;
    println!("{}", serde_json::to_string_pretty(&security)?);
    println!("{}", serde_json::to_string_pretty(&sync)?);
    Ok(())
}
