use crate::config::Config;
use crate::recorder::Event;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wheelhouse_common::api::DownloadRecord;
use wheelhouse_common::errors::*;

/// Ingests download records from the HTTP tier: one json object per line.
/// A bad line is logged and dropped; the serving tier must never be able to
/// wedge the farm.
pub async fn spawn(
    config: Arc<Config>,
    recorder: mpsc::Sender<Event>,
    shutdown: CancellationToken,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(&config.log_bind)
        .await
        .with_context(|| format!("Failed to bind log socket: {:?}", config.log_bind))?;
    let addr = listener.local_addr()?;
    info!("download log socket listening on {}", addr);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("log connection from {}", addr);
                        let recorder = recorder.clone();
                        let token = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, recorder, token).await;
                        });
                    }
                    Err(err) => warn!("log socket accept failed: {}", err),
                },
            }
        }
        debug!("download log ingester exited");
    });
    Ok((addr, handle))
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    recorder: mpsc::Sender<Event>,
    shutdown: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    debug!("log connection read failed: {}", err);
                    break;
                }
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DownloadRecord>(&line) {
            Ok(record) => {
                if recorder.send(Event::Download(record)).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("dropping malformed download record: {}", err),
        }
    }
}
