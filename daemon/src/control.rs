use crate::config::{self, Config};
use crate::db::DbClient;
use crate::dispatch::DispatchMsg;
use crate::status::StatusMsg;
use crate::transfer::TransferControl;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufStream;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use wheelhouse_common::errors::*;
use wheelhouse_common::proto::control::{ControlReply, ControlRequest};
use wheelhouse_common::proto;
use wheelhouse_common::PkgName;

/// Administrative endpoint: every command is forwarded as a typed message
/// to the actor that owns the state, and the reply goes back to this caller
/// only.
pub async fn spawn(
    config: Arc<Config>,
    config_path: Option<PathBuf>,
    db: DbClient,
    dispatch: mpsc::Sender<DispatchMsg>,
    status: mpsc::Sender<StatusMsg>,
    transfers: TransferControl,
    shutdown: CancellationToken,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(&config.control_bind)
        .await
        .with_context(|| format!("Failed to bind control socket: {:?}", config.control_bind))?;
    let addr = listener.local_addr()?;
    info!("control socket listening on {}", addr);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("control connection from {}", addr);
                        let handler = Handler {
                            config: config.clone(),
                            config_path: config_path.clone(),
                            db: db.clone(),
                            dispatch: dispatch.clone(),
                            status: status.clone(),
                            transfers: transfers.clone(),
                        };
                        let token = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handler.serve(stream, token).await {
                                debug!("control connection {} ended: {:#}", addr, err);
                            }
                        });
                    }
                    Err(err) => warn!("control socket accept failed: {}", err),
                },
            }
        }
        debug!("control endpoint exited");
    });
    Ok((addr, handle))
}

struct Handler {
    config: Arc<Config>,
    config_path: Option<PathBuf>,
    db: DbClient,
    dispatch: mpsc::Sender<DispatchMsg>,
    status: mpsc::Sender<StatusMsg>,
    transfers: TransferControl,
}

impl Handler {
    async fn serve(
        &self,
        stream: tokio::net::TcpStream,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut stream = BufStream::new(stream);
        loop {
            let request: ControlRequest = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = proto::recv(&mut stream) => match request? {
                    Some(request) => request,
                    None => break,
                },
            };
            let reply = match self.handle(request).await {
                Ok(reply) => reply,
                Err(err) => ControlReply::Error {
                    message: format!("{:#}", err),
                },
            };
            proto::send(&mut stream, &reply).await?;
        }
        Ok(())
    }

    async fn handle(&self, request: ControlRequest) -> Result<ControlReply> {
        match request {
            ControlRequest::Hello => Ok(ControlReply::Hello {
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
            ControlRequest::Pause => {
                let (reply_tx, reply_rx) = oneshot::channel();
                self.dispatch
                    .send(DispatchMsg::Pause { reply: reply_tx })
                    .await
                    .map_err(|_| format_err!("Dispatch is gone"))?;
                reply_rx.await?;
                let _ = self.status.send(StatusMsg::Paused(true)).await;
                Ok(ControlReply::Ok)
            }
            ControlRequest::Resume => {
                let (reply_tx, reply_rx) = oneshot::channel();
                self.dispatch
                    .send(DispatchMsg::Resume { reply: reply_tx })
                    .await
                    .map_err(|_| format_err!("Dispatch is gone"))?;
                reply_rx.await?;
                let _ = self.status.send(StatusMsg::Paused(false)).await;
                Ok(ControlReply::Ok)
            }
            ControlRequest::KillSlave { slave_id } => {
                let (reply_tx, reply_rx) = oneshot::channel();
                self.dispatch
                    .send(DispatchMsg::KillSlave {
                        slave_id,
                        reply: reply_tx,
                    })
                    .await
                    .map_err(|_| format_err!("Dispatch is gone"))?;
                if reply_rx.await? {
                    Ok(ControlReply::Ok)
                } else {
                    bail!("Unknown slave: {}", slave_id)
                }
            }
            ControlRequest::Skip {
                package,
                version,
                reason,
            } => {
                if reason.is_empty() {
                    bail!("A skip reason is required");
                }
                let package = package.parse::<PkgName>()?;
                let found = match &version {
                    Some(version) => {
                        self.db
                            .skip_package_version(&package, version, &reason)
                            .await?
                    }
                    None => self.db.skip_package(&package, &reason).await?,
                };
                if !found {
                    bail!("Unknown package or version: {}", package);
                }
                // Anything mid-build for it finishes with Done, unrecorded.
                let _ = self
                    .dispatch
                    .send(DispatchMsg::Abort {
                        package: package.into_string(),
                        version,
                    })
                    .await;
                Ok(ControlReply::Ok)
            }
            ControlRequest::Unskip { package, version } => {
                let package = package.parse::<PkgName>()?;
                let found = match &version {
                    Some(version) => {
                        self.db.skip_package_version(&package, version, "").await?
                    }
                    None => self.db.skip_package(&package, "").await?,
                };
                if !found {
                    bail!("Unknown package or version: {}", package);
                }
                Ok(ControlReply::Ok)
            }
            ControlRequest::Rebuild { package, version } => {
                let package = package.parse::<PkgName>()?;
                let project = self
                    .db
                    .get_project(&package)
                    .await?
                    .ok_or_else(|| format_err!("Unknown package: {}", package))?;

                let mut build_ids = BTreeSet::new();
                for project_version in &project.versions {
                    let wanted = version
                        .as_deref()
                        .map(|v| v == project_version.version)
                        .unwrap_or(true);
                    if !wanted {
                        continue;
                    }
                    for file in &project_version.files {
                        build_ids.insert(file.build_id);
                    }
                }
                if build_ids.is_empty() {
                    bail!("No recorded builds to forget for {}", package);
                }
                for build_id in build_ids {
                    if let Some(deleted) = self.db.delete_build(build_id).await? {
                        self.transfers
                            .remove(&deleted.package, deleted.filenames)
                            .await?;
                    }
                }
                Ok(ControlReply::Ok)
            }
            ControlRequest::Reload => {
                let fresh = config::load(self.config_path.as_deref())
                    .context("Config reload failed")?;
                let (applied, restart_required) = diff_config(&self.config, &fresh);
                if applied
                    .iter()
                    .any(|field| field == "busy_timeout" || field == "idle_timeout")
                {
                    let _ = self
                        .dispatch
                        .send(DispatchMsg::SetTimeouts {
                            busy: fresh.busy_timeout,
                            idle: fresh.idle_timeout,
                        })
                        .await;
                }
                Ok(ControlReply::Reloaded {
                    applied,
                    restart_required,
                })
            }
            ControlRequest::GetStatus => {
                let stats = self.db.get_statistics().await?;
                let (reply_tx, reply_rx) = oneshot::channel();
                self.dispatch
                    .send(DispatchMsg::ListSlaves { reply: reply_tx })
                    .await
                    .map_err(|_| format_err!("Dispatch is gone"))?;
                let (slaves, paused) = reply_rx.await?;
                Ok(ControlReply::Status {
                    stats,
                    slaves,
                    paused,
                })
            }
        }
    }
}

/// Splits a reloaded configuration into fields that can change live and
/// fields that need a restart.
fn diff_config(current: &Config, fresh: &Config) -> (Vec<String>, Vec<String>) {
    let mut applied = Vec::new();
    let mut restart = Vec::new();

    if current.busy_timeout != fresh.busy_timeout {
        applied.push("busy_timeout".to_string());
    }
    if current.idle_timeout != fresh.idle_timeout {
        applied.push("idle_timeout".to_string());
    }

    if current.db_url != fresh.db_url {
        restart.push("database.url".to_string());
    }
    if current.db_workers != fresh.db_workers {
        restart.push("database.workers".to_string());
    }
    if current.output_path != fresh.output_path {
        restart.push("paths.output".to_string());
    }
    if current.slave_bind != fresh.slave_bind
        || current.file_bind != fresh.file_bind
        || current.log_bind != fresh.log_bind
        || current.status_bind != fresh.status_bind
        || current.control_bind != fresh.control_bind
        || current.import_bind != fresh.import_bind
    {
        restart.push("sockets".to_string());
    }
    if current.abis != fresh.abis {
        restart.push("dispatch.abis".to_string());
    }
    if current.pending_limit != fresh.pending_limit {
        restart.push("dispatch.pending_limit".to_string());
    }
    if current.upstream != fresh.upstream || current.sync_interval != fresh.sync_interval {
        restart.push("sync".to_string());
    }
    if current.refresh_batch != fresh.refresh_batch {
        restart.push("sync.refresh_batch".to_string());
    }
    if current.write_cycle != fresh.write_cycle {
        restart.push("index.write_cycle_ms".to_string());
    }
    if current.stats_interval != fresh.stats_interval {
        restart.push("status.interval_secs".to_string());
    }
    if current.transfer_retries != fresh.transfer_retries {
        restart.push("transfers.retries".to_string());
    }

    (applied, restart)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use std::time::Duration;

    #[test]
    fn reload_applies_timeouts_and_flags_bindings() {
        let current = Config::from_file(ConfigFile::default()).unwrap();
        let mut file = ConfigFile::default();
        file.dispatch.busy_timeout_secs = 60;
        file.sockets.slave = "0.0.0.0:7777".to_string();
        let fresh = Config::from_file(file).unwrap();

        let (applied, restart) = diff_config(&current, &fresh);
        assert_eq!(applied, vec!["busy_timeout".to_string()]);
        assert_eq!(restart, vec!["sockets".to_string()]);
        assert_eq!(fresh.busy_timeout, Duration::from_secs(60));
    }

    #[test]
    fn identical_config_reloads_cleanly() {
        let current = Config::from_file(ConfigFile::default()).unwrap();
        let fresh = Config::from_file(ConfigFile::default()).unwrap();
        let (applied, restart) = diff_config(&current, &fresh);
        assert!(applied.is_empty());
        assert!(restart.is_empty());
    }
}
