use crate::config::Config;
use crate::index::{IndexItem, ScribeMsg};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wheelhouse_common::errors::*;

pub mod config;
pub mod control;
pub mod db;
pub mod dispatch;
pub mod downloads;
pub mod import;
pub mod index;
pub mod indexer;
pub mod models;
pub mod recorder;
pub mod schema;
pub mod status;
pub mod sync;
pub mod transfer;

/// Boots every actor, then waits for ctrl-c. Shutdown is one broadcast:
/// actors drain their queues and exit; the database pool goes down last so
/// final flushes still commit.
pub async fn run(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    let config = Arc::new(config);
    fs::create_dir_all(&config.output_path)
        .with_context(|| format!("Failed to create output directory: {:?}", config.output_path))?;

    let shutdown = CancellationToken::new();
    let db_shutdown = CancellationToken::new();

    let (db, mutations) = db::spawn(&config.db_url, config.db_workers, db_shutdown.clone())?;

    let (scribe_tx, scribe_handle) =
        index::Scribe::spawn(config.clone(), db.clone(), shutdown.clone())?;
    let indexer_handle = indexer::spawn(mutations, scribe_tx.clone(), shutdown.clone());
    let (transfers, _, transfer_handle) =
        transfer::spawn(config.clone(), shutdown.clone()).await?;
    let (recorder_tx, recorder_handle) = recorder::spawn(db.clone(), shutdown.clone());
    let (dispatch_tx, _, dispatch_handle) = dispatch::SlaveDriver::spawn(
        config.clone(),
        db.clone(),
        transfers.clone(),
        shutdown.clone(),
    )
    .await?;
    let (_, downloads_handle) =
        downloads::spawn(config.clone(), recorder_tx.clone(), shutdown.clone()).await?;
    let (status_tx, _, status_handle) = status::spawn(
        config.clone(),
        db.clone(),
        dispatch_tx.clone(),
        scribe_tx.clone(),
        shutdown.clone(),
    )
    .await?;
    let (_, control_handle) = control::spawn(
        config.clone(),
        config_path,
        db.clone(),
        dispatch_tx.clone(),
        status_tx.clone(),
        transfers.clone(),
        shutdown.clone(),
    )
    .await?;
    let gazer_handle =
        sync::CloudGazer::spawn(config.clone(), db.clone(), recorder_tx.clone(), shutdown.clone())?;
    let (_, import_handle) =
        import::spawn(config.clone(), db.clone(), transfers.clone(), shutdown.clone()).await?;

    // Make sure a fresh farm serves a root page before the first build.
    let _ = scribe_tx.send(ScribeMsg::Item(IndexItem::RewriteRoot)).await;

    info!("wheelhouse master is up");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    info!("shutting down");

    shutdown.cancel();
    for handle in [
        gazer_handle,
        import_handle,
        control_handle,
        status_handle,
        downloads_handle,
        dispatch_handle,
        recorder_handle,
        transfer_handle,
        indexer_handle,
        scribe_handle,
    ] {
        let _ = handle.await;
    }
    db_shutdown.cancel();

    info!("goodbye");
    Ok(())
}
