use crate::config::Config;
use crate::db::{BuildRecord, DbClient};
use crate::transfer::{TransferControl, TransferOutcome};
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::BufStream;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wheelhouse_common::errors::*;
use wheelhouse_common::proto::import::{ImportRequest, ImportReply};
use wheelhouse_common::proto;
use wheelhouse_common::{BuildStatus, PkgName};

/// Importer transfer ids live far above the slave id range so the two can
/// never collide on the transfer socket.
const IMPORT_ID_BASE: u32 = 0x8000_0000;

/// Registers externally built wheels: metadata arrives here, the payload
/// goes through the same verified transfer path the slaves use, and the
/// result is one ordinary build attempt attributed to the importer.
pub async fn spawn(
    config: Arc<Config>,
    db: DbClient,
    transfers: TransferControl,
    shutdown: CancellationToken,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(&config.import_bind)
        .await
        .with_context(|| format!("Failed to bind import socket: {:?}", config.import_bind))?;
    let addr = listener.local_addr()?;
    info!("import socket listening on {}", addr);

    let ids = Arc::new(AtomicU32::new(IMPORT_ID_BASE));
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("import connection from {}", addr);
                        let db = db.clone();
                        let transfers = transfers.clone();
                        let ids = ids.clone();
                        let token = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(err) =
                                handle_connection(stream, db, transfers, ids, token).await
                            {
                                info!("import from {} failed: {:#}", addr, err);
                            }
                        });
                    }
                    Err(err) => warn!("import socket accept failed: {}", err),
                },
            }
        }
        debug!("import endpoint exited");
    });
    Ok((addr, handle))
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    db: DbClient,
    transfers: TransferControl,
    ids: Arc<AtomicU32>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut stream = BufStream::new(stream);

    let request: ImportRequest = match proto::recv(&mut stream).await? {
        Some(request) => request,
        None => return Ok(()),
    };
    let (package, version, abi_tag, built_by, duration_ms, output, files) = match request {
        ImportRequest::Import {
            package,
            version,
            abi_tag,
            built_by,
            duration_ms,
            output,
            files,
        } => (package, version, abi_tag, built_by, duration_ms, output, files),
        other => bail!("Expected an import submission, got {:?}", other),
    };

    let result = run_import(
        &mut stream,
        &db,
        &transfers,
        &ids,
        &shutdown,
        package,
        version,
        abi_tag,
        built_by,
        duration_ms,
        output,
        files,
    )
    .await;
    match result {
        Ok(build_id) => {
            proto::send(&mut stream, &ImportReply::Done { build_id }).await?;
            Ok(())
        }
        Err(err) => {
            let reply = ImportReply::Error {
                message: format!("{:#}", err),
            };
            let _ = proto::send(&mut stream, &reply).await;
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_import(
    stream: &mut BufStream<tokio::net::TcpStream>,
    db: &DbClient,
    transfers: &TransferControl,
    ids: &AtomicU32,
    shutdown: &CancellationToken,
    package: String,
    version: String,
    abi_tag: String,
    built_by: String,
    duration_ms: u64,
    output: String,
    files: Vec<wheelhouse_common::WheelFile>,
) -> Result<i32> {
    if files.is_empty() {
        bail!("An import needs at least one wheel");
    }
    let package = package.parse::<PkgName>()?.into_string();
    let now = Utc::now().naive_utc();

    // Imports may precede upstream discovery; registration is idempotent.
    db.add_new_package(&package, "", now).await?;
    db.add_new_package_version(&package, &version, now, "").await?;

    let transfer_id = ids.fetch_add(1, Ordering::Relaxed);
    let mut installed: Vec<String> = Vec::new();

    for wheel in &files {
        transfers
            .expect(transfer_id, &package, wheel.clone())
            .await?;
        proto::send(
            stream,
            &ImportReply::Send {
                slave_id: transfer_id,
                filename: wheel.filename.clone(),
            },
        )
        .await?;

        let confirmation: Option<ImportRequest> = tokio::select! {
            _ = shutdown.cancelled() => None,
            confirmation = proto::recv(stream) => confirmation?,
        };
        match confirmation {
            Some(ImportRequest::Sent) => {}
            Some(ImportRequest::Abort) | None => {
                let _ = transfers.cancel(transfer_id).await;
                cleanup(transfers, &package, &installed).await;
                bail!("Import aborted by client");
            }
            Some(other) => {
                let _ = transfers.cancel(transfer_id).await;
                cleanup(transfers, &package, &installed).await;
                bail!("Unexpected import message: {:?}", other);
            }
        }

        match transfers.verify(transfer_id).await? {
            TransferOutcome::Verified => installed.push(wheel.filename.clone()),
            outcome => {
                cleanup(transfers, &package, &installed).await;
                bail!("Transfer of {} not verified: {:?}", wheel.filename, outcome);
            }
        }
    }

    let record = BuildRecord {
        package: package.clone(),
        version: version.clone(),
        abi_tag,
        built_by: Some(built_by),
        duration_ms,
        status: BuildStatus::Success,
        started_at: now,
        output,
        files,
    };
    match db.log_build(record).await? {
        Some(build_id) => {
            info!("imported build {} for {} {}", build_id, package, version);
            Ok(build_id)
        }
        None => {
            cleanup(transfers, &package, &installed).await;
            bail!("Version {} {} is skipped", package, version)
        }
    }
}

async fn cleanup(transfers: &TransferControl, package: &str, installed: &[String]) {
    if installed.is_empty() {
        return;
    }
    if let Err(err) = transfers.remove(package, installed.to_vec()).await {
        warn!("Failed to clean up imported files: {:#}", err);
    }
}
