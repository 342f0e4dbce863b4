use crate::config::Config;
use crate::db::DbClient;
use crate::dispatch::DispatchMsg;
use crate::index::ScribeMsg;
use std::sync::Arc;
use tokio::io::BufStream;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use wheelhouse_common::api::{SlaveSummary, StatsSnapshot};
use wheelhouse_common::errors::*;
use wheelhouse_common::proto::{self, control::StatusEvent};

#[derive(Debug)]
pub enum StatusMsg {
    Paused(bool),
}

/// Keeps the most recent statistics and slave list, pushes deltas to every
/// attached monitor, and feeds the stats page to the index writer.
pub async fn spawn(
    config: Arc<Config>,
    db: DbClient,
    dispatch: mpsc::Sender<DispatchMsg>,
    scribe: mpsc::Sender<ScribeMsg>,
    shutdown: CancellationToken,
) -> Result<(
    mpsc::Sender<StatusMsg>,
    std::net::SocketAddr,
    tokio::task::JoinHandle<()>,
)> {
    let listener = TcpListener::bind(&config.status_bind)
        .await
        .with_context(|| format!("Failed to bind status socket: {:?}", config.status_bind))?;
    let addr = listener.local_addr()?;
    info!("status socket listening on {}", addr);

    let (tx, rx) = mpsc::channel(16);
    let broadcaster = Broadcaster {
        config,
        db,
        dispatch,
        scribe,
        rx,
        shutdown,
        stats: None,
        slaves: Vec::new(),
        paused: false,
        monitors: Vec::new(),
    };
    let handle = tokio::spawn(broadcaster.run(listener));
    Ok((tx, addr, handle))
}

struct Broadcaster {
    config: Arc<Config>,
    db: DbClient,
    dispatch: mpsc::Sender<DispatchMsg>,
    scribe: mpsc::Sender<ScribeMsg>,
    rx: mpsc::Receiver<StatusMsg>,
    shutdown: CancellationToken,
    stats: Option<StatsSnapshot>,
    slaves: Vec<SlaveSummary>,
    paused: bool,
    monitors: Vec<mpsc::Sender<StatusEvent>>,
}

impl Broadcaster {
    async fn run(mut self, listener: TcpListener) {
        let mut poll = tokio::time::interval(self.config.stats_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = poll.tick() => self.refresh().await,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("monitor attached from {}", addr);
                        self.attach(stream);
                    }
                    Err(err) => warn!("status socket accept failed: {}", err),
                },
                msg = self.rx.recv() => match msg {
                    Some(StatusMsg::Paused(paused)) => {
                        self.paused = paused;
                        self.broadcast(StatusEvent::Paused { paused });
                    }
                    None => break,
                },
            }
        }
        debug!("status broadcaster exited");
    }

    /// Pulls fresh statistics and the slave list; only deltas go out.
    async fn refresh(&mut self) {
        match self.db.get_statistics().await {
            Ok(stats) => {
                if self.stats.as_ref() != Some(&stats) {
                    self.broadcast(StatusEvent::Stats {
                        stats: stats.clone(),
                    });
                    let _ = self.scribe.try_send(ScribeMsg::Stats(stats.clone()));
                    self.stats = Some(stats);
                }
            }
            Err(err) => warn!("Failed to collect statistics: {:#}", err),
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .dispatch
            .send(DispatchMsg::ListSlaves { reply: reply_tx })
            .await
            .is_ok()
        {
            if let Ok((slaves, paused)) = reply_rx.await {
                if slaves != self.slaves {
                    self.broadcast(StatusEvent::Slaves {
                        slaves: slaves.clone(),
                    });
                    self.slaves = slaves;
                }
                if paused != self.paused {
                    self.paused = paused;
                    self.broadcast(StatusEvent::Paused { paused });
                }
            }
        }
    }

    fn attach(&mut self, stream: tokio::net::TcpStream) {
        let (tx, mut rx) = mpsc::channel::<StatusEvent>(16);

        // Late joiners start from the current picture.
        if let Some(stats) = &self.stats {
            let _ = tx.try_send(StatusEvent::Stats {
                stats: stats.clone(),
            });
        }
        let _ = tx.try_send(StatusEvent::Slaves {
            slaves: self.slaves.clone(),
        });
        let _ = tx.try_send(StatusEvent::Paused {
            paused: self.paused,
        });
        self.monitors.push(tx);

        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut stream = BufStream::new(stream);
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if proto::send(&mut stream, &event).await.is_err() {
                    break;
                }
            }
        });
    }

    fn broadcast(&mut self, event: StatusEvent) {
        // A monitor that cannot keep up loses its feed rather than slowing
        // the farm down.
        self.monitors
            .retain(|monitor| monitor.try_send(event.clone()).is_ok());
    }
}
