use crate::config::Config;
use crate::db::{BuildRecord, DbClient};
use crate::transfer::{TransferControl, TransferOutcome};
use chrono::{NaiveDateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufStream;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use wheelhouse_common::api::{SlavePhase, SlaveSummary};
use wheelhouse_common::config::{SLEEP_INITIAL, SLEEP_MAX};
use wheelhouse_common::errors::*;
use wheelhouse_common::proto::slave::{MasterReply, SlaveRequest};
use wheelhouse_common::proto;
use wheelhouse_common::{BuildStatus, WheelFile};

/// How often the registry is swept for silent slaves.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum DispatchMsg {
    Request {
        slave_id: Option<u32>,
        request: SlaveRequest,
        reply: oneshot::Sender<MasterReply>,
    },
    /// The connection died without a `Bye`; retire and requeue.
    Disconnected {
        slave_id: u32,
    },
    Pause {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
    KillSlave {
        slave_id: u32,
        reply: oneshot::Sender<bool>,
    },
    /// Deprecate a package (or one version) mid-build: matching in-flight
    /// assignments finish with `Done` on the next heartbeat, unrecorded.
    Abort {
        package: String,
        version: Option<String>,
    },
    SetTimeouts {
        busy: Duration,
        idle: Duration,
    },
    ListSlaves {
        reply: oneshot::Sender<(Vec<SlaveSummary>, bool)>,
    },
}

#[derive(Debug)]
enum Phase {
    Idle,
    Building {
        package: String,
        version: String,
    },
    Sending {
        record: Box<BuildRecord>,
        queue: VecDeque<WheelFile>,
        current: WheelFile,
        installed: Vec<String>,
    },
}

struct Slave {
    label: String,
    abi_tag: String,
    #[allow(dead_code)]
    platform_tag: String,
    last_seen: NaiveDateTime,
    sleep_secs: u64,
    kill: bool,
    abort: bool,
    phase: Phase,
}

impl Slave {
    fn assignment(&self) -> Option<(String, String)> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Building { package, version } => Some((package.clone(), version.clone())),
            Phase::Sending { record, .. } => {
                Some((record.package.clone(), record.version.clone()))
            }
        }
    }

    fn summary(&self, slave_id: u32) -> SlaveSummary {
        SlaveSummary {
            slave_id,
            label: self.label.clone(),
            abi_tag: self.abi_tag.clone(),
            phase: match self.phase {
                Phase::Idle => SlavePhase::Idle,
                Phase::Building { .. } => SlavePhase::Building,
                Phase::Sending { .. } => SlavePhase::Sending,
            },
            last_seen: self.last_seen,
            current_build: self.assignment(),
        }
    }
}

pub struct SlaveDriver {
    config: Arc<Config>,
    db: DbClient,
    transfers: TransferControl,
    rx: mpsc::Receiver<DispatchMsg>,
    shutdown: CancellationToken,
    slaves: HashMap<u32, Slave>,
    next_slave_id: u32,
    paused: bool,
    busy_timeout: Duration,
    idle_timeout: Duration,
    /// Assignments handed out but not yet recorded, keyed
    /// `(package, version, abi)`; hides them from other slaves.
    in_flight: HashSet<(String, String, String)>,
    /// Per-ABI cache of the pending view, refilled from the database.
    queues: HashMap<String, VecDeque<(String, String)>>,
}

impl SlaveDriver {
    pub async fn spawn(
        config: Arc<Config>,
        db: DbClient,
        transfers: TransferControl,
        shutdown: CancellationToken,
    ) -> Result<(
        mpsc::Sender<DispatchMsg>,
        std::net::SocketAddr,
        tokio::task::JoinHandle<()>,
    )> {
        let listener = TcpListener::bind(&config.slave_bind)
            .await
            .with_context(|| format!("Failed to bind slave socket: {:?}", config.slave_bind))?;
        let addr = listener.local_addr()?;
        info!("slave dispatch socket listening on {}", addr);

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(accept_loop(listener, tx.clone(), shutdown.clone()));

        let driver = SlaveDriver {
            busy_timeout: config.busy_timeout,
            idle_timeout: config.idle_timeout,
            config,
            db,
            transfers,
            rx,
            shutdown,
            slaves: HashMap::new(),
            next_slave_id: 1,
            paused: false,
            in_flight: HashSet::new(),
            queues: HashMap::new(),
        };
        let handle = tokio::spawn(driver.run());
        Ok((tx, addr, handle))
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sweep.tick() => self.sweep().await,
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
            }
        }

        // Anything still queued gets a terminal answer so no slave hangs on
        // a request while the master goes down.
        self.rx.close();
        while let Ok(msg) = self.rx.try_recv() {
            if let DispatchMsg::Request { request, reply, .. } = msg {
                let answer = match request {
                    SlaveRequest::Hello { .. } | SlaveRequest::Idle => MasterReply::Die,
                    _ => MasterReply::Done,
                };
                let _ = reply.send(answer);
            }
        }
        debug!("slave driver exited");
    }

    async fn handle(&mut self, msg: DispatchMsg) {
        match msg {
            DispatchMsg::Request {
                slave_id,
                request,
                reply,
            } => {
                let answer = self.handle_slave(slave_id, request).await;
                let _ = reply.send(answer);
            }
            DispatchMsg::Disconnected { slave_id } => {
                if self.slaves.contains_key(&slave_id) {
                    info!("slave {} disconnected, retiring", slave_id);
                    self.retire(slave_id, true).await;
                }
            }
            DispatchMsg::Pause { reply } => {
                info!("dispatch paused");
                self.paused = true;
                let _ = reply.send(());
            }
            DispatchMsg::Resume { reply } => {
                info!("dispatch resumed");
                self.paused = false;
                let _ = reply.send(());
            }
            DispatchMsg::KillSlave { slave_id, reply } => {
                let known = match self.slaves.get_mut(&slave_id) {
                    Some(slave) => {
                        slave.kill = true;
                        true
                    }
                    None => false,
                };
                let _ = reply.send(known);
            }
            DispatchMsg::Abort { package, version } => {
                for (slave_id, slave) in self.slaves.iter_mut() {
                    if let Some((pkg, ver)) = slave.assignment() {
                        let matches = pkg == package
                            && version.as_deref().map(|v| v == ver).unwrap_or(true);
                        if matches {
                            info!("tagging build on slave {} for abort", slave_id);
                            slave.abort = true;
                        }
                    }
                }
                // Cached queue entries for it are stale now.
                for queue in self.queues.values_mut() {
                    queue.retain(|(pkg, ver)| {
                        !(pkg == &package
                            && version.as_deref().map(|v| v == ver.as_str()).unwrap_or(true))
                    });
                }
            }
            DispatchMsg::SetTimeouts { busy, idle } => {
                self.busy_timeout = busy;
                self.idle_timeout = idle;
            }
            DispatchMsg::ListSlaves { reply } => {
                let mut slaves: Vec<SlaveSummary> = self
                    .slaves
                    .iter()
                    .map(|(slave_id, slave)| slave.summary(*slave_id))
                    .collect();
                slaves.sort_by_key(|summary| summary.slave_id);
                let _ = reply.send((slaves, self.paused));
            }
        }
    }

    async fn handle_slave(
        &mut self,
        slave_id: Option<u32>,
        request: SlaveRequest,
    ) -> MasterReply {
        let now = Utc::now().naive_utc();

        let request = match request {
            SlaveRequest::Hello {
                label,
                abi_tag,
                platform_tag,
                ..
            } => {
                // A re-hello on a live connection starts a fresh
                // registration.
                if let Some(old_id) = slave_id {
                    self.retire(old_id, true).await;
                }
                let new_id = self.next_slave_id;
                self.next_slave_id += 1;
                info!("slave {} registered: {} ({})", new_id, label, abi_tag);
                self.slaves.insert(
                    new_id,
                    Slave {
                        label,
                        abi_tag,
                        platform_tag,
                        last_seen: now,
                        sleep_secs: SLEEP_INITIAL,
                        kill: false,
                        abort: false,
                        phase: Phase::Idle,
                    },
                );
                return MasterReply::Hello {
                    slave_id: new_id,
                    timestamp: now,
                };
            }
            other => other,
        };

        let slave_id = match slave_id {
            Some(slave_id) if self.slaves.contains_key(&slave_id) => slave_id,
            // Unknown or unregistered slave: tell it to start over.
            _ => return MasterReply::Die,
        };
        self.slaves
            .get_mut(&slave_id)
            .expect("slave checked above")
            .last_seen = now;

        if self.slaves[&slave_id].kill {
            self.retire(slave_id, true).await;
            return MasterReply::Die;
        }

        match request {
            SlaveRequest::Hello { .. } => unreachable!("handled above"),
            SlaveRequest::Idle => self.handle_idle(slave_id).await,
            SlaveRequest::Busy => self.handle_busy(slave_id).await,
            SlaveRequest::Built {
                status,
                duration_ms,
                output,
                files,
            } => {
                self.handle_built(slave_id, status, duration_ms, output, files)
                    .await
            }
            SlaveRequest::Sent => self.handle_sent(slave_id).await,
            SlaveRequest::Bye => {
                info!("slave {} said goodbye", slave_id);
                self.retire(slave_id, true).await;
                MasterReply::Done
            }
        }
    }

    async fn handle_idle(&mut self, slave_id: u32) -> MasterReply {
        if !matches!(self.slaves[&slave_id].phase, Phase::Idle) {
            warn!("slave {} sent idle while assigned, retiring", slave_id);
            self.retire(slave_id, true).await;
            return MasterReply::Die;
        }
        if self.paused {
            return MasterReply::Cont;
        }

        let abi = self.slaves[&slave_id].abi_tag.clone();
        match self.next_build(&abi).await {
            Some((package, version)) => {
                info!(
                    "dispatching {} {} ({}) to slave {}",
                    package, version, abi, slave_id
                );
                self.in_flight
                    .insert((package.clone(), version.clone(), abi));
                let slave = self.slaves.get_mut(&slave_id).expect("slave exists");
                slave.sleep_secs = SLEEP_INITIAL;
                slave.phase = Phase::Building {
                    package: package.clone(),
                    version: version.clone(),
                };
                MasterReply::Build { package, version }
            }
            None => {
                let slave = self.slaves.get_mut(&slave_id).expect("slave exists");
                let seconds = slave.sleep_secs;
                slave.sleep_secs = (slave.sleep_secs * 2).min(SLEEP_MAX);
                MasterReply::Sleep { seconds }
            }
        }
    }

    async fn handle_busy(&mut self, slave_id: u32) -> MasterReply {
        let slave = self.slaves.get_mut(&slave_id).expect("slave exists");
        match &slave.phase {
            Phase::Building { .. } if slave.abort => {
                info!("aborting build on slave {}", slave_id);
                let assignment = slave.assignment();
                slave.abort = false;
                slave.phase = Phase::Idle;
                self.clear_in_flight(slave_id, assignment);
                MasterReply::Done
            }
            Phase::Building { .. } | Phase::Sending { .. } => MasterReply::Cont,
            Phase::Idle => {
                warn!("slave {} sent busy while idle, retiring", slave_id);
                self.retire(slave_id, false).await;
                MasterReply::Die
            }
        }
    }

    async fn handle_built(
        &mut self,
        slave_id: u32,
        status: BuildStatus,
        duration_ms: u64,
        output: String,
        files: Vec<WheelFile>,
    ) -> MasterReply {
        let slave = self.slaves.get_mut(&slave_id).expect("slave exists");
        let (package, version) = match &slave.phase {
            Phase::Building { package, version } => (package.clone(), version.clone()),
            _ => {
                warn!("slave {} sent built while unassigned, retiring", slave_id);
                self.retire(slave_id, true).await;
                return MasterReply::Die;
            }
        };

        if slave.abort {
            info!(
                "discarding aborted build of {} {} from slave {}",
                package, version, slave_id
            );
            slave.abort = false;
            slave.phase = Phase::Idle;
            self.clear_in_flight(slave_id, Some((package, version)));
            return MasterReply::Done;
        }

        let record = BuildRecord {
            package: package.clone(),
            version: version.clone(),
            abi_tag: slave.abi_tag.clone(),
            built_by: Some(slave.label.clone()),
            duration_ms,
            status,
            started_at: Utc::now().naive_utc()
                - chrono::Duration::milliseconds(duration_ms as i64),
            output,
            files,
        };

        if status.is_success() && !record.files.is_empty() {
            let mut queue: VecDeque<WheelFile> = record.files.iter().cloned().collect();
            let current = queue.pop_front().expect("files checked non-empty");
            let filename = current.filename.clone();
            if let Err(err) = self
                .transfers
                .expect(slave_id, &package, current.clone())
                .await
            {
                error!("Failed to register transfer: {:#}", err);
                self.finish_build(slave_id, None).await;
                return MasterReply::Done;
            }
            let slave = self.slaves.get_mut(&slave_id).expect("slave exists");
            slave.phase = Phase::Sending {
                record: Box::new(record),
                queue,
                current,
                installed: Vec::new(),
            };
            return MasterReply::Send { filename };
        }

        // Failures and file-less successes are recorded right away; either
        // way the slave goes back to the pool.
        self.finish_build(slave_id, Some(record)).await;
        MasterReply::Done
    }

    async fn handle_sent(&mut self, slave_id: u32) -> MasterReply {
        let slave = self.slaves.get_mut(&slave_id).expect("slave exists");
        let aborted = slave.abort;
        let (record, mut queue, current, mut installed) =
            match std::mem::replace(&mut slave.phase, Phase::Idle) {
                Phase::Sending {
                    record,
                    queue,
                    current,
                    installed,
                } => (record, queue, current, installed),
                other => {
                    // Put the phase back so retirement requeues correctly.
                    self.slaves
                        .get_mut(&slave_id)
                        .expect("slave exists")
                        .phase = other;
                    warn!("slave {} sent sent while not sending, retiring", slave_id);
                    self.retire(slave_id, true).await;
                    return MasterReply::Die;
                }
            };

        let outcome = match self.transfers.verify(slave_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Failed to verify transfer: {:#}", err);
                TransferOutcome::Failed
            }
        };

        match outcome {
            TransferOutcome::Verified => {
                installed.push(current.filename.clone());
                if aborted {
                    info!("aborting upload from slave {} after skip", slave_id);
                    self.discard_installed(&record.package, installed).await;
                    let slave = self.slaves.get_mut(&slave_id).expect("slave exists");
                    slave.abort = false;
                    self.clear_in_flight(
                        slave_id,
                        Some((record.package.clone(), record.version.clone())),
                    );
                    return MasterReply::Done;
                }
                if let Some(next) = queue.pop_front() {
                    let filename = next.filename.clone();
                    if let Err(err) = self
                        .transfers
                        .expect(slave_id, &record.package, next.clone())
                        .await
                    {
                        error!("Failed to register transfer: {:#}", err);
                        self.fail_transfer(slave_id, *record, installed).await;
                        return MasterReply::Done;
                    }
                    let slave = self.slaves.get_mut(&slave_id).expect("slave exists");
                    slave.phase = Phase::Sending {
                        record,
                        queue,
                        current: next,
                        installed,
                    };
                    MasterReply::Send { filename }
                } else {
                    // Everything on disk and verified; now the attempt, its
                    // files and dependencies become one transaction.
                    self.log_sent_build(slave_id, *record, installed).await;
                    MasterReply::Done
                }
            }
            TransferOutcome::Failed | TransferOutcome::Missing => {
                warn!(
                    "transfer from slave {} not verified ({:?}), failing build",
                    slave_id, outcome
                );
                self.fail_transfer(slave_id, *record, installed).await;
                MasterReply::Done
            }
        }
    }

    /// Records a finished build (or silently drops it when `record` is
    /// `None`) and returns the slave to the idle pool.
    async fn finish_build(&mut self, slave_id: u32, record: Option<BuildRecord>) {
        let slave = self.slaves.get_mut(&slave_id).expect("slave exists");
        let assignment = slave.assignment();
        slave.phase = Phase::Idle;
        self.clear_in_flight(slave_id, assignment);

        if let Some(record) = record {
            let package = record.package.clone();
            let version = record.version.clone();
            match self.db.log_build(record).await {
                Ok(Some(build_id)) => {
                    debug!("recorded build {} for {} {}", build_id, package, version)
                }
                Ok(None) => {
                    info!("discarded build of skipped {} {}", package, version)
                }
                Err(err) => error!(
                    "Failed to record build of {} {}: {:#}",
                    package, version, err
                ),
            }
        }
    }

    /// The upload path failed for good: clean the artifacts that already
    /// made it to disk and record a failed attempt so the version stays in
    /// the pending view.
    async fn fail_transfer(
        &mut self,
        slave_id: u32,
        mut record: BuildRecord,
        installed: Vec<String>,
    ) {
        self.discard_installed(&record.package, installed).await;
        let _ = self.transfers.cancel(slave_id).await;
        record.status = BuildStatus::Failure;
        record.files = Vec::new();
        let assignment = Some((record.package.clone(), record.version.clone()));
        self.clear_in_flight(slave_id, assignment);
        if let Err(err) = self.db.log_build(record).await {
            error!("Failed to record failed transfer: {:#}", err);
        }
    }

    async fn log_sent_build(
        &mut self,
        slave_id: u32,
        record: BuildRecord,
        installed: Vec<String>,
    ) {
        let package = record.package.clone();
        let version = record.version.clone();
        let slave = self.slaves.get_mut(&slave_id).expect("slave exists");
        slave.phase = Phase::Idle;
        self.clear_in_flight(slave_id, Some((package.clone(), version.clone())));

        match self.db.log_build(record).await {
            Ok(Some(build_id)) => {
                info!("build {} complete: {} {}", build_id, package, version)
            }
            Ok(None) => {
                // Skipped between dispatch and upload: the files must not
                // outlive the discarded attempt.
                info!("discarding uploads of skipped {} {}", package, version);
                self.discard_installed(&package, installed).await;
            }
            Err(err) => {
                error!(
                    "Failed to record build of {} {}: {:#}",
                    package, version, err
                );
                self.discard_installed(&package, installed).await;
            }
        }
    }

    async fn discard_installed(&self, package: &str, installed: Vec<String>) {
        if installed.is_empty() {
            return;
        }
        if let Err(err) = self.transfers.remove(package, installed).await {
            warn!("Failed to discard installed files: {:#}", err);
        }
    }

    fn clear_in_flight(&mut self, slave_id: u32, assignment: Option<(String, String)>) {
        if let Some((package, version)) = assignment {
            if let Some(slave) = self.slaves.get(&slave_id) {
                self.in_flight
                    .remove(&(package, version, slave.abi_tag.clone()));
            }
        }
    }

    /// Next dispatchable `(package, version)` for an ABI. The per-ABI cache
    /// is refilled from the pending view; entries already in flight on
    /// another slave are passed over.
    async fn next_build(&mut self, abi: &str) -> Option<(String, String)> {
        if let Some(entry) = self.pop_cached(abi) {
            return Some(entry);
        }
        let pending = match self
            .db
            .get_pending_builds(abi, self.config.pending_limit)
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                warn!("Failed to fetch pending builds: {:#}", err);
                return None;
            }
        };
        self.queues.entry(abi.to_string()).or_default().extend(pending);
        self.pop_cached(abi)
    }

    fn pop_cached(&mut self, abi: &str) -> Option<(String, String)> {
        let queue = self.queues.get_mut(abi)?;
        while let Some((package, version)) = queue.pop_front() {
            if !self
                .in_flight
                .contains(&(package.clone(), version.clone(), abi.to_string()))
            {
                return Some((package, version));
            }
        }
        None
    }

    async fn retire(&mut self, slave_id: u32, requeue: bool) {
        if let Some(slave) = self.slaves.remove(&slave_id) {
            if let Some((package, version)) = slave.assignment() {
                self.in_flight
                    .remove(&(package.clone(), version.clone(), slave.abi_tag.clone()));
                if matches!(slave.phase, Phase::Sending { .. }) {
                    let _ = self.transfers.cancel(slave_id).await;
                    if let Phase::Sending { installed, .. } = &slave.phase {
                        self.discard_installed(&package, installed.clone()).await;
                    }
                }
                if requeue {
                    debug!("returning {} {} to the pending set", package, version);
                }
            }
        }
    }

    /// Drops slaves that have gone silent. Busy slaves get the longer
    /// deadline; their assignment goes back to the pending set and any
    /// half-uploaded file is cleaned up.
    async fn sweep(&mut self) {
        let now = Utc::now().naive_utc();
        let expired: Vec<u32> = self
            .slaves
            .iter()
            .filter(|(_, slave)| {
                let silent = (now - slave.last_seen)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                match slave.phase {
                    Phase::Idle => silent > self.idle_timeout,
                    _ => silent > self.busy_timeout,
                }
            })
            .map(|(slave_id, _)| *slave_id)
            .collect();
        for slave_id in expired {
            warn!("slave {} timed out, retiring", slave_id);
            self.retire(slave_id, true).await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatch: mpsc::Sender<DispatchMsg>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("slave connection from {}", addr);
                    let dispatch = dispatch.clone();
                    let token = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, dispatch, token).await {
                            debug!("slave connection {} ended: {:#}", addr, err);
                        }
                    });
                }
                Err(err) => warn!("slave socket accept failed: {}", err),
            },
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    dispatch: mpsc::Sender<DispatchMsg>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut stream = BufStream::new(stream);
    let mut slave_id: Option<u32> = None;

    loop {
        let request: Option<SlaveRequest> = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = proto::recv(&mut stream) => match request {
                Ok(request) => request,
                Err(err) => {
                    // Malformed traffic and dead sockets end the same way:
                    // the driver retires the slave and requeues its build.
                    if let Some(slave_id) = slave_id {
                        let _ = dispatch
                            .send(DispatchMsg::Disconnected { slave_id })
                            .await;
                    }
                    return Err(err.into());
                }
            },
        };
        let request = match request {
            Some(request) => request,
            None => {
                // Clean close without a Bye still retires the registration.
                if let Some(slave_id) = slave_id {
                    let _ = dispatch
                        .send(DispatchMsg::Disconnected { slave_id })
                        .await;
                }
                break;
            }
        };

        let said_bye = matches!(request, SlaveRequest::Bye);
        let (reply_tx, reply_rx) = oneshot::channel();
        dispatch
            .send(DispatchMsg::Request {
                slave_id,
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| format_err!("Dispatch actor is gone"))?;
        let reply = reply_rx
            .await
            .map_err(|_| format_err!("Dispatch dropped the request"))?;

        if said_bye {
            break;
        }
        if let MasterReply::Hello {
            slave_id: assigned, ..
        } = reply
        {
            slave_id = Some(assigned);
        }
        let is_die = matches!(reply, MasterReply::Die);
        proto::send(&mut stream, &reply).await?;
        if is_die {
            break;
        }
    }
    Ok(())
}
