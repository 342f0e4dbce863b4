use crate::config::Config;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use wheelhouse_common::config::CHUNK_SIZE;
use wheelhouse_common::errors::*;
use wheelhouse_common::proto::transfer::{DoneCode, TransferFrame};
use wheelhouse_common::utils::file_sha256;
use wheelhouse_common::WheelFile;

/// Result of the most recent transfer for a slave, as seen by dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Verified,
    Failed,
    /// No completed transfer on record (still running, or never started).
    Missing,
}

#[derive(Debug)]
enum JugglerMsg {
    Expect {
        slave_id: u32,
        package: String,
        wheel: WheelFile,
    },
    Cancel {
        slave_id: u32,
    },
    Claim {
        slave_id: u32,
        reply: oneshot::Sender<Option<(String, WheelFile)>>,
    },
    Commit {
        slave_id: u32,
        temp: PathBuf,
        reply: oneshot::Sender<bool>,
    },
    Fail {
        slave_id: u32,
    },
    Verify {
        slave_id: u32,
        reply: oneshot::Sender<TransferOutcome>,
    },
    Remove {
        package: String,
        filenames: Vec<String>,
        reply: oneshot::Sender<()>,
    },
}

/// Handle other actors use to talk to the upload area. All notifications
/// are fire-and-forget from the juggler's point of view; replies come back
/// on dedicated oneshot channels.
#[derive(Clone)]
pub struct TransferControl {
    tx: mpsc::Sender<JugglerMsg>,
}

impl TransferControl {
    pub async fn expect(&self, slave_id: u32, package: &str, wheel: WheelFile) -> Result<()> {
        self.tx
            .send(JugglerMsg::Expect {
                slave_id,
                package: package.to_string(),
                wheel,
            })
            .await
            .map_err(|_| format_err!("File transfer actor is gone"))
    }

    pub async fn cancel(&self, slave_id: u32) -> Result<()> {
        self.tx
            .send(JugglerMsg::Cancel { slave_id })
            .await
            .map_err(|_| format_err!("File transfer actor is gone"))
    }

    pub async fn verify(&self, slave_id: u32) -> Result<TransferOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(JugglerMsg::Verify {
                slave_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| format_err!("File transfer actor is gone"))?;
        Ok(reply_rx.await?)
    }

    pub async fn remove(&self, package: &str, filenames: Vec<String>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(JugglerMsg::Remove {
                package: package.to_string(),
                filenames,
                reply: reply_tx,
            })
            .await
            .map_err(|_| format_err!("File transfer actor is gone"))?;
        Ok(reply_rx.await?)
    }
}

#[derive(Debug)]
enum Slot {
    Expected { package: String, wheel: WheelFile },
    Claimed { package: String, wheel: WheelFile },
    Done(bool),
}

pub async fn spawn(
    config: Arc<Config>,
    shutdown: CancellationToken,
) -> Result<(TransferControl, std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    // Anything in the temp area is a torn upload from a previous run.
    let tmp = config.tmp_path();
    if tmp.exists() {
        fs::remove_dir_all(&tmp).context("Failed to clear upload temp area")?;
    }
    fs::create_dir_all(&tmp).context("Failed to create upload temp area")?;
    fs::create_dir_all(config.simple_path())
        .context("Failed to create artifact directory")?;

    let listener = TcpListener::bind(&config.file_bind)
        .await
        .with_context(|| format!("Failed to bind file socket: {:?}", config.file_bind))?;
    let addr = listener.local_addr()?;
    info!("file transfer socket listening on {}", addr);

    let (tx, rx) = mpsc::channel(64);
    let control = TransferControl { tx: tx.clone() };
    let handle = tokio::spawn(run(config, listener, tx, rx, shutdown));
    Ok((control, addr, handle))
}

async fn run(
    config: Arc<Config>,
    listener: TcpListener,
    tx: mpsc::Sender<JugglerMsg>,
    mut rx: mpsc::Receiver<JugglerMsg>,
    shutdown: CancellationToken,
) {
    let mut slots: HashMap<u32, Slot> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("upload connection from {}", addr);
                    let tx = tx.clone();
                    let tmp = config.tmp_path();
                    let retries = config.transfer_retries;
                    let token = shutdown.clone();
                    tokio::spawn(async move {
                        let stream = BufStream::new(stream);
                        tokio::select! {
                            _ = token.cancelled() => {}
                            result = handle_connection(stream, tx, tmp, retries) => {
                                if let Err(err) = result {
                                    debug!("upload from {} aborted: {:#}", addr, err);
                                }
                            }
                        }
                    });
                }
                Err(err) => warn!("file socket accept failed: {}", err),
            },
            msg = rx.recv() => match msg {
                Some(msg) => handle_msg(&config, &mut slots, msg),
                None => break,
            },
        }
    }
    debug!("file transfer actor exited");
}

fn handle_msg(config: &Config, slots: &mut HashMap<u32, Slot>, msg: JugglerMsg) {
    match msg {
        JugglerMsg::Expect {
            slave_id,
            package,
            wheel,
        } => {
            slots.insert(slave_id, Slot::Expected { package, wheel });
        }
        JugglerMsg::Cancel { slave_id } => {
            if let Some(slot) = slots.remove(&slave_id) {
                if let Slot::Expected { wheel, .. } | Slot::Claimed { wheel, .. } = slot {
                    let temp = temp_path(&config.tmp_path(), slave_id, &wheel.filename);
                    if let Err(err) = fs::remove_file(&temp) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            warn!("Failed to remove partial upload {:?}: {}", temp, err);
                        }
                    }
                }
            }
        }
        JugglerMsg::Claim { slave_id, reply } => {
            let claimed = match slots.get(&slave_id) {
                Some(Slot::Expected { package, wheel }) => {
                    Some((package.clone(), wheel.clone()))
                }
                _ => None,
            };
            if let Some((package, wheel)) = &claimed {
                slots.insert(
                    slave_id,
                    Slot::Claimed {
                        package: package.clone(),
                        wheel: wheel.clone(),
                    },
                );
            }
            let _ = reply.send(claimed);
        }
        JugglerMsg::Commit {
            slave_id,
            temp,
            reply,
        } => {
            let accepted = match slots.get(&slave_id) {
                Some(Slot::Claimed { package, wheel }) => {
                    match install(config, package, &wheel.filename, &temp) {
                        Ok(()) => true,
                        Err(err) => {
                            error!(
                                "Failed to install {} for slave {}: {:#}",
                                wheel.filename, slave_id, err
                            );
                            false
                        }
                    }
                }
                _ => false,
            };
            if accepted {
                slots.insert(slave_id, Slot::Done(true));
            } else {
                // Unexpected commit: drop the temp file, it belongs to no one.
                let _ = fs::remove_file(&temp);
                slots.insert(slave_id, Slot::Done(false));
            }
            let _ = reply.send(accepted);
        }
        JugglerMsg::Fail { slave_id } => {
            slots.insert(slave_id, Slot::Done(false));
        }
        JugglerMsg::Verify { slave_id, reply } => {
            let outcome = match slots.get(&slave_id) {
                Some(Slot::Done(true)) => TransferOutcome::Verified,
                Some(Slot::Done(false)) => TransferOutcome::Failed,
                _ => TransferOutcome::Missing,
            };
            if matches!(outcome, TransferOutcome::Verified | TransferOutcome::Failed) {
                slots.remove(&slave_id);
            }
            let _ = reply.send(outcome);
        }
        JugglerMsg::Remove {
            package,
            filenames,
            reply,
        } => {
            for filename in filenames {
                let path = config.simple_path().join(&package).join(&filename);
                match fs::remove_file(&path) {
                    Ok(()) => info!("removed artifact {:?}", path),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!("Failed to remove artifact {:?}: {}", path, err),
                }
            }
            let _ = reply.send(());
        }
    }
}

/// Atomically moves a fully verified upload into the package directory.
/// Rename-on-same-filesystem means a filename visible under `simple/` is
/// always complete and hash-checked.
fn install(config: &Config, package: &str, filename: &str, temp: &std::path::Path) -> Result<()> {
    let dir = config.simple_path().join(package);
    fs::create_dir_all(&dir)?;
    let target = dir.join(filename);
    fs::rename(temp, &target)
        .with_context(|| format!("Failed to move upload into place: {:?}", target))?;
    info!("installed artifact {:?}", target);
    Ok(())
}

fn temp_path(tmp: &std::path::Path, slave_id: u32, filename: &str) -> PathBuf {
    tmp.join(format!("{}-{}", slave_id, filename))
}

fn chunk_count(filesize: u64) -> u32 {
    filesize.div_ceil(CHUNK_SIZE as u64) as u32
}

fn chunk_size(filesize: u64, index: u32) -> u32 {
    let offset = index as u64 * CHUNK_SIZE as u64;
    (filesize - offset).min(CHUNK_SIZE as u64) as u32
}

async fn handle_connection<S>(
    mut stream: S,
    state: mpsc::Sender<JugglerMsg>,
    tmp: PathBuf,
    retries: u32,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let slave_id = match TransferFrame::read_from(&mut stream).await? {
        Some(TransferFrame::Hello { slave_id }) => slave_id,
        Some(other) => bail!("Expected hello frame, got {:?}", other),
        None => return Ok(()),
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .send(JugglerMsg::Claim {
            slave_id,
            reply: reply_tx,
        })
        .await
        .map_err(|_| format_err!("File transfer actor is gone"))?;
    let (_, wheel) = match reply_rx.await? {
        Some(claimed) => claimed,
        None => {
            TransferFrame::Done {
                code: DoneCode::Error,
            }
            .write_to(&mut stream)
            .await?;
            bail!("No transfer expected from slave {}", slave_id);
        }
    };

    let temp = temp_path(&tmp, slave_id, &wheel.filename);
    for attempt in 0..=retries {
        receive_file(&mut stream, &temp, wheel.filesize).await?;

        let (size, hash) = file_sha256(&temp).await?;
        if size == wheel.filesize && hash == wheel.filehash {
            let (reply_tx, reply_rx) = oneshot::channel();
            state
                .send(JugglerMsg::Commit {
                    slave_id,
                    temp: temp.clone(),
                    reply: reply_tx,
                })
                .await
                .map_err(|_| format_err!("File transfer actor is gone"))?;
            let code = if reply_rx.await? {
                DoneCode::Ok
            } else {
                DoneCode::Error
            };
            TransferFrame::Done { code }.write_to(&mut stream).await?;
            return Ok(());
        }

        warn!(
            "hash mismatch for {} from slave {} (attempt {}/{})",
            wheel.filename,
            slave_id,
            attempt + 1,
            retries + 1
        );
        if attempt < retries {
            TransferFrame::Done {
                code: DoneCode::Retry,
            }
            .write_to(&mut stream)
            .await?;
        }
    }

    let _ = tokio::fs::remove_file(&temp).await;
    let _ = state.send(JugglerMsg::Fail { slave_id }).await;
    TransferFrame::Done {
        code: DoneCode::Error,
    }
    .write_to(&mut stream)
    .await?;
    bail!(
        "Transfer of {} from slave {} failed after {} attempts",
        wheel.filename,
        slave_id,
        retries + 1
    )
}

/// Pulls every chunk of the file, re-requesting until none are missing.
async fn receive_file<S>(stream: &mut S, temp: &std::path::Path, filesize: u64) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(temp)
        .await
        .with_context(|| format!("Failed to create upload temp file: {:?}", temp))?;
    file.set_len(filesize).await?;

    let chunks = chunk_count(filesize);
    let mut received = vec![false; chunks as usize];

    while let Some(index) = received.iter().position(|done| !done) {
        let index = index as u32;
        TransferFrame::Fetch {
            index,
            size: chunk_size(filesize, index),
        }
        .write_to(stream)
        .await?;

        match TransferFrame::read_from(stream).await? {
            Some(TransferFrame::Chunk { index, data }) => {
                if index >= chunks || data.len() as u32 != chunk_size(filesize, index) {
                    bail!("Chunk {} has unexpected size {}", index, data.len());
                }
                file.seek(std::io::SeekFrom::Start(index as u64 * CHUNK_SIZE as u64))
                    .await?;
                file.write_all(&data).await?;
                received[index as usize] = true;
            }
            Some(other) => bail!("Expected chunk frame, got {:?}", other),
            None => bail!("Upload connection closed mid-transfer"),
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_math_covers_the_file() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64 + 1), 2);
        assert_eq!(chunk_size(CHUNK_SIZE as u64 + 1, 0), CHUNK_SIZE);
        assert_eq!(chunk_size(CHUNK_SIZE as u64 + 1, 1), 1);
    }

    #[tokio::test]
    async fn upload_round_trip_installs_verified_file() {
        use sha2::{Digest, Sha256};
        use wheelhouse_common::WheelTags;

        let out = tempfile::tempdir().unwrap();
        let mut file = crate::config::ConfigFile::default();
        file.paths.output = out.path().to_path_buf();
        let config = Arc::new(crate::config::Config::from_file(file).unwrap());
        fs::create_dir_all(config.tmp_path()).unwrap();
        fs::create_dir_all(config.simple_path()).unwrap();

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let wheel = WheelFile {
            filename: "foo-1.0-cp39-cp39-linux_armv7l.whl".to_string(),
            filesize: payload.len() as u64,
            filehash: hex::encode(Sha256::digest(&payload)),
            tags: WheelTags::from_filename("foo-1.0-cp39-cp39-linux_armv7l.whl").unwrap(),
            dependencies: vec![],
        };

        // State task standing in for the listener loop.
        let (tx, mut rx) = mpsc::channel(16);
        let state_config = config.clone();
        let state = tokio::spawn(async move {
            let mut slots = HashMap::new();
            while let Some(msg) = rx.recv().await {
                handle_msg(&state_config, &mut slots, msg);
            }
        });
        tx.send(JugglerMsg::Expect {
            slave_id: 9,
            package: "foo".to_string(),
            wheel: wheel.clone(),
        })
        .await
        .unwrap();

        let (server_io, mut client_io) = tokio::io::duplex(1024 * 1024);
        let server = tokio::spawn(handle_connection(
            server_io,
            tx.clone(),
            config.tmp_path(),
            3,
        ));

        // Scripted slave: hello, answer fetches, expect ok.
        TransferFrame::Hello { slave_id: 9 }
            .write_to(&mut client_io)
            .await
            .unwrap();
        loop {
            match TransferFrame::read_from(&mut client_io).await.unwrap() {
                Some(TransferFrame::Fetch { index, size }) => {
                    let offset = index as usize * CHUNK_SIZE as usize;
                    let data = payload[offset..offset + size as usize].to_vec();
                    TransferFrame::Chunk { index, data }
                        .write_to(&mut client_io)
                        .await
                        .unwrap();
                }
                Some(TransferFrame::Done { code }) => {
                    assert_eq!(code, DoneCode::Ok);
                    break;
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        server.await.unwrap().unwrap();
        let installed = config.simple_path().join("foo").join(&wheel.filename);
        assert_eq!(fs::read(&installed).unwrap(), payload);

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(JugglerMsg::Verify {
            slave_id: 9,
            reply: reply_tx,
        })
        .await
        .unwrap();
        assert_eq!(reply_rx.await.unwrap(), TransferOutcome::Verified);

        drop(tx);
        state.await.unwrap();
    }
}
