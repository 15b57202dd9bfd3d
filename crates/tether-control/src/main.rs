use std::sync::Arc;

use anyhow::Context;
use sea_orm_migration::MigratorTrait;
use tether_control::{
    config::CoordinatorConfig,
    context::{ContextHandle, spawn_context},
    host::detached_host,
    observer::TracingObserver,
    storage::ResourceStore,
};

const USAGE: &str = "usage: tether-control <list|purge|reset>";

async fn run_command(handle: &ContextHandle, command: &str) -> anyhow::Result<()> {
    match command {
        "list" => {
            let infos = handle
                .get_all_registrations_info()
                .await
                .context("listing registrations")?;
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
        "purge" => {
            let count = handle
                .purge_resources()
                .await
                .context("purging resources")?;
            tracing::info!(count, "purged resource bodies");
            println!("purged {count} resource(s)");
        }
        "reset" => {
            handle
                .delete_and_start_over()
                .await
                .context("deleting all registrations")?;
            println!("storage reset");
        }
        other => anyhow::bail!("unknown command {other:?}; {USAGE}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let command = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!(USAGE))?;

    let mut config = CoordinatorConfig::from_env();
    // One-shot admin commands purge explicitly.
    config.purge_on_startup = false;

    let db = tether_db::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;

    // Apply migrations on boot (idempotent).
    tether_migration::Migrator::up(&db, None)
        .await
        .context("applying migrations")?;

    let host = detached_host(config.body_root.clone());
    let (handle, task) = spawn_context(
        config,
        ResourceStore::new(db),
        host,
        Arc::new(TracingObserver),
    );

    let result = run_command(&handle, &command).await;
    handle.shutdown().await;
    task.await.context("context task panicked")?;
    result
}
