use crate::db::{DbClient, DbError};
use chrono::NaiveDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wheelhouse_common::api::DownloadRecord;
use wheelhouse_common::errors::*;

/// Queue depth in front of the recorder. Producers block when this is full;
/// events are never dropped.
const QUEUE: usize = 256;

/// Ephemeral observations that need to become rows eventually. Producers
/// fire these and move on; the recorder owns the write path.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    NewPackage {
        package: String,
        observed_at: NaiveDateTime,
    },
    NewVersion {
        package: String,
        version: String,
        released_at: NaiveDateTime,
    },
    /// A package disappeared upstream; it is hidden, never deleted, so old
    /// builds stay attributable.
    SkippedUpstream {
        package: String,
        reason: String,
    },
    Download(DownloadRecord),
}

pub fn spawn(
    db: DbClient,
    shutdown: CancellationToken,
) -> (mpsc::Sender<Event>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE);
    let handle = tokio::spawn(run(db, rx, shutdown));
    (tx, handle)
}

async fn run(db: DbClient, mut rx: mpsc::Receiver<Event>, shutdown: CancellationToken) {
    let mut buffer: Vec<Event> = Vec::new();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        buffer.push(event);
        // Take whatever else is already queued so downloads batch up.
        while let Ok(event) = rx.try_recv() {
            buffer.push(event);
        }
        process(&db, &mut buffer).await;
    }

    // Drain up to the end marker before going down; in-flight producers
    // have already been cancelled.
    while let Ok(event) = rx.try_recv() {
        buffer.push(event);
    }
    process(&db, &mut buffer).await;
    debug!("recorder exited");
}

/// Writes the buffered events in arrival order, batching runs of downloads
/// into one transaction. Individual failures are logged and dropped so one
/// bad record cannot wedge the queue.
async fn process(db: &DbClient, buffer: &mut Vec<Event>) {
    let mut downloads: Vec<DownloadRecord> = Vec::new();
    for event in buffer.drain(..) {
        match event {
            Event::Download(record) => downloads.push(record),
            other => {
                flush_downloads(db, &mut downloads).await;
                if let Err(err) = write_event(db, &other).await {
                    warn!("Failed to record {:?}: {:#}", other, err);
                }
            }
        }
    }
    flush_downloads(db, &mut downloads).await;
}

async fn write_event(db: &DbClient, event: &Event) -> Result<()> {
    match event {
        Event::NewPackage {
            package,
            observed_at,
        } => {
            retry_once(|| db.add_new_package(package, "", *observed_at)).await?;
        }
        Event::NewVersion {
            package,
            version,
            released_at,
        } => {
            retry_once(|| db.add_new_package_version(package, version, *released_at, ""))
                .await?;
        }
        Event::SkippedUpstream { package, reason } => {
            retry_once(|| db.skip_package(package, reason)).await?;
        }
        Event::Download(_) => unreachable!("downloads are batched"),
    }
    Ok(())
}

async fn flush_downloads(db: &DbClient, downloads: &mut Vec<DownloadRecord>) {
    if downloads.is_empty() {
        return;
    }
    let batch = std::mem::take(downloads);
    let count = batch.len();
    if let Err(err) = retry_once(|| db.log_downloads(batch.clone())).await {
        warn!("Failed to record {} downloads: {:#}", count, err);
    }
}

/// Transient DB errors get one retry; integrity errors do not.
async fn retry_once<T, F, Fut>(mut call: F) -> std::result::Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, DbError>>,
{
    match call().await {
        Err(DbError::Transient(err)) => {
            debug!("Retrying transient db error: {}", err);
            call().await
        }
        other => other,
    }
}
