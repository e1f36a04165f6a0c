mod config;
mod credentials;
mod error;
mod main_loop;
mod mastodon_client;
mod reconcile;
mod source;
mod store;

use std::sync::Arc;

use anyhow::Context;
use common::types::Domain;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, HASHTAG};
use crate::main_loop::Driver;
use crate::mastodon_client::MastodonClient;
use crate::reconcile::Reconciler;
use crate::store::{RecordStore, SledStore};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting kernelsprite");

    let config = Config::from_env()?;

    let store = Arc::new(SledStore::open(&config.db_path)?);
    store.ensure_collections()?;
    tracing::info!(
        posts = store.len(Domain::Posts),
        followers = store.len(Domain::Followers),
        "Opened record store at {}",
        config.db_path.display()
    );

    let credentials =
        credentials::load_or_authorize(&config.server, &config.credentials_path).await?;

    let client = MastodonClient::new(
        config.server.clone(),
        HASHTAG,
        credentials.access_token,
        config.max_pages,
    )?;
    tracing::info!(
        "Watching #{} on {} ({} failure policy)",
        HASHTAG,
        config.server,
        config.failure_policy
    );

    let reconciler = Reconciler::new(store.clone(), Arc::new(client), config.failure_policy);
    let driver = Driver::new(reconciler, config.cycle_delay);

    let shutdown = CancellationToken::new();
    let loop_shutdown = shutdown.clone();
    let reconcile_task = tokio::spawn(async move { driver.run(loop_shutdown).await });

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    eprintln!("Received Ctrl-C, shutting down...");

    shutdown.cancel();
    reconcile_task.await.context("reconcile loop panicked")?;
    store.flush().context("flushing record store")?;

    Ok(())
}
