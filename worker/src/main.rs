use crate::args::Args;
use crate::build::BuildResult;
use crate::config::Config;
use chrono::Utc;
use clap::Parser;
use env_logger::Env;
use std::process::exit;
use std::time::Duration;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::sync::watch;
use wheelhouse_common::config::{BUSY_INTERVAL, PAUSED_POLL, SLAVE_ERROR_DELAY};
use wheelhouse_common::errors::*;
use wheelhouse_common::proto::slave::{MasterReply, SlaveRequest};
use wheelhouse_common::proto::transfer::{upload_file, DoneCode};
use wheelhouse_common::proto;

mod args;
mod build;
mod config;

/// Why a session with the master ended.
enum SessionEnd {
    /// The master told us to go away; exit cleanly.
    Died,
    /// We said goodbye on shutdown.
    Bye,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let logging = match args.verbose {
        0 => "info",
        1 => "wheelhouse_worker=debug,wheelhouse_common=debug,info",
        _ => "trace",
    };
    env_logger::init_from_env(Env::default().default_filter_or(logging));

    dotenv::dotenv().ok();
    let config = match config::load(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("Configuration error: {:#}", err);
            exit(2);
        }
    };
    if args.check_config {
        println!("{:#?}", config);
        return;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    loop {
        match session(&config, shutdown_rx.clone()).await {
            Ok(SessionEnd::Died) => {
                info!("master dismissed this slave, exiting");
                return;
            }
            Ok(SessionEnd::Bye) => {
                info!("shutting down");
                return;
            }
            Err(err) => {
                error!(
                    "Session failed, reconnecting in {}s: {:#}",
                    SLAVE_ERROR_DELAY, err
                );
                tokio::time::sleep(Duration::from_secs(SLAVE_ERROR_DELAY)).await;
            }
        }
        if *shutdown_rx.borrow() {
            return;
        }
    }
}

async fn session(config: &Config, mut shutdown: watch::Receiver<bool>) -> Result<SessionEnd> {
    let stream = TcpStream::connect(&config.master)
        .await
        .with_context(|| format!("Failed to connect to master: {:?}", config.master))?;
    let mut stream = BufStream::new(stream);

    proto::send(
        &mut stream,
        &SlaveRequest::Hello {
            timestamp: Utc::now().naive_utc(),
            label: config.label.clone(),
            abi_tag: config.abi_tag.clone(),
            platform_tag: config.platform_tag.clone(),
            py_tag: config.py_tag.clone(),
            os_name: std::env::consts::OS.to_string(),
            os_version: String::new(),
            board_revision: String::new(),
            board_serial: String::new(),
        },
    )
    .await?;
    let slave_id = match recv_reply(&mut stream).await? {
        MasterReply::Hello { slave_id, .. } => slave_id,
        other => bail!("Expected hello reply, got {:?}", other),
    };
    info!("registered with master as slave {}", slave_id);

    loop {
        if *shutdown.borrow() {
            proto::send(&mut stream, &SlaveRequest::Bye).await?;
            return Ok(SessionEnd::Bye);
        }

        proto::send(&mut stream, &SlaveRequest::Idle).await?;
        match recv_reply(&mut stream).await? {
            MasterReply::Sleep { seconds } => {
                debug!("nothing to do, sleeping {}s", seconds);
                wait(Duration::from_secs(seconds), &mut shutdown).await;
            }
            MasterReply::Cont => {
                wait(Duration::from_secs(PAUSED_POLL), &mut shutdown).await;
            }
            MasterReply::Die => return Ok(SessionEnd::Died),
            MasterReply::Build { package, version } => {
                info!("building {} {}", package, version);
                match run_build(&mut stream, config, &package, &version).await? {
                    Some(result) => {
                        report(&mut stream, config, slave_id, result).await?;
                    }
                    None => {
                        info!("build of {} {} aborted by master", package, version);
                    }
                }
            }
            other => bail!("Unexpected reply to idle: {:?}", other),
        }
    }
}

/// Runs the build while heartbeating; `None` means the master aborted it.
async fn run_build(
    stream: &mut BufStream<TcpStream>,
    config: &Config,
    package: &str,
    version: &str,
) -> Result<Option<BuildResult>> {
    let mut building = Box::pin(build::build(config, package, version));
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + Duration::from_secs(BUSY_INTERVAL),
        Duration::from_secs(BUSY_INTERVAL),
    );
    loop {
        tokio::select! {
            result = &mut building => return Ok(Some(result?)),
            _ = heartbeat.tick() => {
                proto::send(stream, &SlaveRequest::Busy).await?;
                match recv_reply(stream).await? {
                    MasterReply::Cont => {}
                    MasterReply::Done => return Ok(None),
                    MasterReply::Die => bail!("Master dismissed us mid-build"),
                    other => bail!("Unexpected reply to busy: {:?}", other),
                }
            }
        }
    }
}

async fn report(
    stream: &mut BufStream<TcpStream>,
    config: &Config,
    slave_id: u32,
    result: BuildResult,
) -> Result<()> {
    proto::send(
        stream,
        &SlaveRequest::Built {
            status: result.status,
            duration_ms: result.duration_ms,
            output: result.output.clone(),
            files: result.files.clone(),
        },
    )
    .await?;

    loop {
        match recv_reply(stream).await? {
            MasterReply::Done => return Ok(()),
            MasterReply::Send { filename } => {
                let scratch = result
                    .scratch
                    .as_ref()
                    .ok_or_else(|| format_err!("Master requested files from an empty build"))?;
                let path = scratch.path().join(&filename);
                info!("uploading {}", filename);
                match upload_file(&config.file_addr, slave_id, &path).await {
                    Ok(DoneCode::Ok) => {}
                    Ok(code) => warn!("upload of {} rejected: {:?}", filename, code),
                    Err(err) => warn!("upload of {} failed: {:#}", filename, err),
                }
                // Sent either way; the master checks the verified outcome
                // and decides what happens next.
                proto::send(stream, &SlaveRequest::Sent).await?;
            }
            other => bail!("Unexpected reply to built: {:?}", other),
        }
    }
}

async fn recv_reply(stream: &mut BufStream<TcpStream>) -> Result<MasterReply> {
    proto::recv(stream)
        .await?
        .ok_or_else(|| format_err!("Master closed the connection"))
}

async fn wait(duration: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}
