use crate::models::{self, BuildDetail, DeletedBuild};
use chrono::NaiveDateTime;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::collections::VecDeque;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use wheelhouse_common::api::{DownloadRecord, StatsSnapshot};
use wheelhouse_common::errors::*;
use wheelhouse_common::{BuildStatus, WheelFile};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// How many requests may sit in front of the broker before producers block.
const REQUEST_QUEUE: usize = 64;

pub fn setup(url: &str) -> Result<SqliteConnection> {
    let mut connection = SqliteConnection::establish(url)
        .with_context(|| format!("Failed to open database: {:?}", url))?;
    connection.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000")?;
    connection
        .run_pending_migrations(MIGRATIONS)
        .map_err(|err| format_err!("Failed to run migrations: {}", err))?;
    Ok(connection)
}

/// Errors surfaced to DB clients. Transient errors may be retried once by
/// the caller; integrity errors must not be.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DbError {
    #[error("constraint violated: {0}")]
    Integrity(String),
    #[error("transient database error: {0}")]
    Transient(String),
    #[error("database request failed: {0}")]
    Other(String),
    #[error("database pool is shutting down")]
    Closed,
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// A mutation that index pages may care about, published by the workers
/// after the transaction committed. Fire-and-forget so the pool can never
/// deadlock against its own consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    PackageAdded { package: String },
    VersionAdded { package: String },
    PackageSkipped { package: String },
    VersionSkipped { package: String },
    BuildLogged { package: String },
    BuildDeleted { package: String, package_has_files: bool },
}

/// One build attempt plus everything that gets committed with it.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRecord {
    pub package: String,
    pub version: String,
    pub abi_tag: String,
    pub built_by: Option<String>,
    pub duration_ms: u64,
    pub status: BuildStatus,
    pub started_at: NaiveDateTime,
    pub output: String,
    pub files: Vec<WheelFile>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectVersion {
    pub version: String,
    pub released_at: NaiveDateTime,
    pub skip: String,
    pub files: Vec<models::File>,
}

/// Everything the project page needs for one package.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectData {
    pub package: String,
    pub skip: String,
    pub versions: Vec<ProjectVersion>,
}

#[derive(Debug)]
pub enum DbOp {
    AddPackage {
        package: String,
        skip: String,
        added_at: NaiveDateTime,
    },
    AddVersion {
        package: String,
        version: String,
        released_at: NaiveDateTime,
        skip: String,
    },
    SkipPackage {
        package: String,
        reason: String,
    },
    SkipVersion {
        package: String,
        version: String,
        reason: String,
    },
    GetPendingBuilds {
        abi: String,
        limit: i64,
    },
    LogBuild(Box<BuildRecord>),
    GetPackageFiles {
        package: String,
    },
    GetProject {
        package: String,
    },
    RootListing,
    AllPackages,
    AllVersions,
    PackageExists {
        package: String,
        version: Option<String>,
    },
    GetStatistics,
    LogDownloads {
        records: Vec<DownloadRecord>,
    },
    GetBuild {
        id: i32,
    },
    DeleteBuild {
        id: i32,
    },
}

#[derive(Debug)]
pub enum DbReply {
    Unit,
    Bool(bool),
    OptId(Option<i32>),
    Pairs(Vec<(String, String)>),
    Names(Vec<String>),
    Files(Vec<models::File>),
    Project(Option<ProjectData>),
    Stats(StatsSnapshot),
    Build(Option<BuildDetail>),
    Deleted(Option<DeletedBuild>),
}

struct DbRequest {
    op: DbOp,
    reply: oneshot::Sender<DbResult<DbReply>>,
}

/// Handle used by every producer actor; one RPC per method, executed as one
/// transaction by some worker.
#[derive(Clone)]
pub struct DbClient {
    tx: mpsc::Sender<DbRequest>,
}

impl DbClient {
    async fn call(&self, op: DbOp) -> DbResult<DbReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DbRequest {
                op,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DbError::Closed)?;
        reply_rx.await.map_err(|_| DbError::Closed)?
    }

    pub async fn add_new_package(
        &self,
        package: &str,
        skip: &str,
        added_at: NaiveDateTime,
    ) -> DbResult<bool> {
        match self
            .call(DbOp::AddPackage {
                package: package.to_string(),
                skip: skip.to_string(),
                added_at,
            })
            .await?
        {
            DbReply::Bool(created) => Ok(created),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_new_package_version(
        &self,
        package: &str,
        version: &str,
        released_at: NaiveDateTime,
        skip: &str,
    ) -> DbResult<bool> {
        match self
            .call(DbOp::AddVersion {
                package: package.to_string(),
                version: version.to_string(),
                released_at,
                skip: skip.to_string(),
            })
            .await?
        {
            DbReply::Bool(created) => Ok(created),
            other => Err(unexpected(other)),
        }
    }

    pub async fn skip_package(&self, package: &str, reason: &str) -> DbResult<bool> {
        match self
            .call(DbOp::SkipPackage {
                package: package.to_string(),
                reason: reason.to_string(),
            })
            .await?
        {
            DbReply::Bool(found) => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    pub async fn skip_package_version(
        &self,
        package: &str,
        version: &str,
        reason: &str,
    ) -> DbResult<bool> {
        match self
            .call(DbOp::SkipVersion {
                package: package.to_string(),
                version: version.to_string(),
                reason: reason.to_string(),
            })
            .await?
        {
            DbReply::Bool(found) => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_pending_builds(
        &self,
        abi: &str,
        limit: i64,
    ) -> DbResult<Vec<(String, String)>> {
        match self
            .call(DbOp::GetPendingBuilds {
                abi: abi.to_string(),
                limit,
            })
            .await?
        {
            DbReply::Pairs(pending) => Ok(pending),
            other => Err(unexpected(other)),
        }
    }

    /// Commits the attempt, its files and their dependencies atomically.
    /// `None` means the version was skipped in the meantime and the build
    /// was discarded without a trace.
    pub async fn log_build(&self, record: BuildRecord) -> DbResult<Option<i32>> {
        match self.call(DbOp::LogBuild(Box::new(record))).await? {
            DbReply::OptId(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_package_files(&self, package: &str) -> DbResult<Vec<models::File>> {
        match self
            .call(DbOp::GetPackageFiles {
                package: package.to_string(),
            })
            .await?
        {
            DbReply::Files(files) => Ok(files),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_project(&self, package: &str) -> DbResult<Option<ProjectData>> {
        match self
            .call(DbOp::GetProject {
                package: package.to_string(),
            })
            .await?
        {
            DbReply::Project(project) => Ok(project),
            other => Err(unexpected(other)),
        }
    }

    pub async fn root_listing(&self) -> DbResult<Vec<String>> {
        match self.call(DbOp::RootListing).await? {
            DbReply::Names(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_all_packages(&self) -> DbResult<Vec<String>> {
        match self.call(DbOp::AllPackages).await? {
            DbReply::Names(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_all_package_versions(&self) -> DbResult<Vec<(String, String)>> {
        match self.call(DbOp::AllVersions).await? {
            DbReply::Pairs(pairs) => Ok(pairs),
            other => Err(unexpected(other)),
        }
    }

    pub async fn package_exists(
        &self,
        package: &str,
        version: Option<&str>,
    ) -> DbResult<bool> {
        match self
            .call(DbOp::PackageExists {
                package: package.to_string(),
                version: version.map(String::from),
            })
            .await?
        {
            DbReply::Bool(found) => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_statistics(&self) -> DbResult<StatsSnapshot> {
        match self.call(DbOp::GetStatistics).await? {
            DbReply::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    pub async fn log_downloads(&self, records: Vec<DownloadRecord>) -> DbResult<()> {
        match self.call(DbOp::LogDownloads { records }).await? {
            DbReply::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_build(&self, id: i32) -> DbResult<Option<BuildDetail>> {
        match self.call(DbOp::GetBuild { id }).await? {
            DbReply::Build(build) => Ok(build),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_build(&self, id: i32) -> DbResult<Option<DeletedBuild>> {
        match self.call(DbOp::DeleteBuild { id }).await? {
            DbReply::Deleted(deleted) => Ok(deleted),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: DbReply) -> DbError {
    DbError::Other(format!("Unexpected reply shape: {:?}", reply))
}

/// Boots the worker threads and the broker task. The returned receiver
/// carries committed mutations for the index layer.
pub fn spawn(
    url: &str,
    workers: usize,
    shutdown: CancellationToken,
) -> Result<(DbClient, mpsc::UnboundedReceiver<Mutation>)> {
    // Run migrations once before any worker connects.
    setup(url)?;

    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
    let (mutation_tx, mutation_rx) = mpsc::unbounded_channel();
    let (idle_tx, idle_rx) = mpsc::unbounded_channel();

    let mut handles = Vec::with_capacity(workers);
    for index in 0..workers {
        let (job_tx, job_rx) = std::sync::mpsc::channel::<DbRequest>();
        let worker = DbWorker {
            index,
            url: url.to_string(),
            idle_tx: idle_tx.clone(),
            mutation_tx: mutation_tx.clone(),
        };
        thread::Builder::new()
            .name(format!("db-worker-{}", index))
            .spawn(move || worker.run(job_rx))
            .context("Failed to spawn db worker thread")?;
        idle_tx
            .send(index)
            .map_err(|_| format_err!("Idle queue closed during setup"))?;
        handles.push(job_tx);
    }

    tokio::spawn(broker(request_rx, idle_rx, handles, shutdown));

    Ok((DbClient { tx: request_tx }, mutation_rx))
}

/// Pairs idle workers with queued requests, strictly FIFO on both sides.
async fn broker(
    mut request_rx: mpsc::Receiver<DbRequest>,
    mut idle_rx: mpsc::UnboundedReceiver<usize>,
    workers: Vec<std::sync::mpsc::Sender<DbRequest>>,
    shutdown: CancellationToken,
) {
    let mut idle: VecDeque<usize> = VecDeque::new();
    let mut pending: VecDeque<DbRequest> = VecDeque::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(index) = idle_rx.recv() => {
                idle.push_back(index);
            }
            request = request_rx.recv() => match request {
                Some(request) => pending.push_back(request),
                None => break,
            },
        }

        while let (Some(&index), true) = (idle.front(), !pending.is_empty()) {
            let request = pending.pop_front().expect("pending checked non-empty");
            idle.pop_front();
            if let Err(err) = workers[index].send(request) {
                // Worker thread is gone; the dropped reply channel tells the
                // caller. Do not hand this worker out again.
                error!("db worker {} unavailable: {}", index, err);
            }
        }
    }

    // Refuse everything still queued, then drop the worker channels so the
    // threads see a closed queue and exit after their current transaction.
    for request in pending {
        let _ = request.reply.send(Err(DbError::Closed));
    }
    request_rx.close();
    while let Ok(request) = request_rx.try_recv() {
        let _ = request.reply.send(Err(DbError::Closed));
    }
    debug!("db broker exited");
}

struct DbWorker {
    index: usize,
    url: String,
    idle_tx: mpsc::UnboundedSender<usize>,
    mutation_tx: mpsc::UnboundedSender<Mutation>,
}

impl DbWorker {
    fn run(self, jobs: std::sync::mpsc::Receiver<DbRequest>) {
        let mut connection = match Self::connect(&self.url) {
            Ok(connection) => connection,
            Err(err) => {
                error!("db worker {} failed to connect: {:#}", self.index, err);
                return;
            }
        };

        while let Ok(request) = jobs.recv() {
            let result = connection
                .transaction(|conn| execute(&request.op, conn).map_err(TxError::from))
                .map_err(TxError::into_db_error);

            let reconnect = matches!(result, Err(DbError::Transient(_)));
            match result {
                Ok((reply, mutation)) => {
                    if let Some(mutation) = mutation {
                        let _ = self.mutation_tx.send(mutation);
                    }
                    let _ = request.reply.send(Ok(reply));
                }
                Err(err) => {
                    let _ = request.reply.send(Err(err));
                }
            }

            if reconnect {
                // The session may be poisoned (dropped socket, restarted
                // server); start over before taking the next request.
                match Self::connect(&self.url) {
                    Ok(fresh) => connection = fresh,
                    Err(err) => {
                        warn!("db worker {} reconnect failed: {:#}", self.index, err)
                    }
                }
            }

            if self.idle_tx.send(self.index).is_err() {
                break;
            }
        }
        debug!("db worker {} exited", self.index);
    }

    fn connect(url: &str) -> Result<SqliteConnection> {
        let mut connection = SqliteConnection::establish(url)?;
        connection.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000")?;
        Ok(connection)
    }
}

/// Adapter so `?` inside the transaction closure keeps diesel's rollback
/// semantics while we classify afterwards.
struct TxError(Error);

impl From<Error> for TxError {
    fn from(err: Error) -> TxError {
        TxError(err)
    }
}

impl From<diesel::result::Error> for TxError {
    fn from(err: diesel::result::Error) -> TxError {
        TxError(err.into())
    }
}

impl TxError {
    fn into_db_error(self) -> DbError {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};
        if let Some(err) = self.0.downcast_ref::<DieselError>() {
            return match err {
                DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)
                | DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info)
                | DieselError::DatabaseError(DatabaseErrorKind::CheckViolation, info)
                | DieselError::DatabaseError(DatabaseErrorKind::NotNullViolation, info) => {
                    DbError::Integrity(info.message().to_string())
                }
                DieselError::DatabaseError(_, info) => {
                    DbError::Transient(info.message().to_string())
                }
                DieselError::BrokenTransactionManager => {
                    DbError::Transient("transaction manager broken".to_string())
                }
                other => DbError::Other(other.to_string()),
            };
        }
        DbError::Other(format!("{:#}", self.0))
    }
}

fn execute(
    op: &DbOp,
    conn: &mut SqliteConnection,
) -> Result<(DbReply, Option<Mutation>)> {
    match op {
        DbOp::AddPackage {
            package,
            skip,
            added_at,
        } => {
            let created = models::NewPackage::new(package.clone(), skip.clone(), *added_at)
                .insert(conn)?;
            let mutation = created.then(|| Mutation::PackageAdded {
                package: package.clone(),
            });
            Ok((DbReply::Bool(created), mutation))
        }
        DbOp::AddVersion {
            package,
            version,
            released_at,
            skip,
        } => {
            let pkg = models::Package::get(package, conn)?
                .ok_or_else(|| format_err!("Unknown package: {:?}", package))?;
            let created = models::NewVersion {
                package_id: pkg.id,
                version: version.clone(),
                released_at: *released_at,
                skip: skip.clone(),
            }
            .insert(conn)?;
            let mutation = created.then(|| Mutation::VersionAdded {
                package: package.clone(),
            });
            Ok((DbReply::Bool(created), mutation))
        }
        DbOp::SkipPackage { package, reason } => {
            match models::Package::get(package, conn)? {
                None => Ok((DbReply::Bool(false), None)),
                // Re-skipping with the same reason happens on every upstream
                // poll; stay quiet so the index writer is not poked for it.
                Some(pkg) if pkg.skip == *reason => Ok((DbReply::Bool(true), None)),
                Some(_) => {
                    models::Package::set_skip(package, reason, conn)?;
                    Ok((
                        DbReply::Bool(true),
                        Some(Mutation::PackageSkipped {
                            package: package.clone(),
                        }),
                    ))
                }
            }
        }
        DbOp::SkipVersion {
            package,
            version,
            reason,
        } => {
            let pkg = match models::Package::get(package, conn)? {
                Some(pkg) => pkg,
                None => return Ok((DbReply::Bool(false), None)),
            };
            match models::Version::get(pkg.id, version, conn)? {
                None => Ok((DbReply::Bool(false), None)),
                Some(ver) if ver.skip == *reason => Ok((DbReply::Bool(true), None)),
                Some(_) => {
                    models::Version::set_skip(pkg.id, version, reason, conn)?;
                    Ok((
                        DbReply::Bool(true),
                        Some(Mutation::VersionSkipped {
                            package: package.clone(),
                        }),
                    ))
                }
            }
        }
        DbOp::GetPendingBuilds { abi, limit } => {
            let pending = models::Version::pending(abi, *limit, conn)?;
            Ok((DbReply::Pairs(pending), None))
        }
        DbOp::LogBuild(record) => {
            let pkg = models::Package::get(&record.package, conn)?
                .ok_or_else(|| format_err!("Unknown package: {:?}", record.package))?;
            let version = models::Version::get(pkg.id, &record.version, conn)?
                .ok_or_else(|| {
                    format_err!("Unknown version: {} {}", record.package, record.version)
                })?;
            if !pkg.skip.is_empty() || !version.skip.is_empty() {
                return Ok((DbReply::OptId(None), None));
            }

            let build_id = models::NewBuild {
                version_id: version.id,
                abi_tag: record.abi_tag.clone(),
                built_by: record.built_by.clone(),
                duration_ms: record.duration_ms as i64,
                status: record.status.is_success(),
                started_at: record.started_at,
                build_log: record.output.clone(),
            }
            .insert(conn)?;

            if record.status.is_success() {
                for wheel in &record.files {
                    models::File::from_wheel(wheel, build_id).insert(conn)?;
                    let deps: Vec<models::NewDependency> = wheel
                        .dependencies
                        .iter()
                        .map(|dep| models::NewDependency::from_wheel(&wheel.filename, dep))
                        .collect();
                    models::NewDependency::insert_batch(&deps, conn)?;
                }
            }

            let mutation = (record.status.is_success() && !record.files.is_empty()).then(|| {
                Mutation::BuildLogged {
                    package: record.package.clone(),
                }
            });
            Ok((DbReply::OptId(Some(build_id)), mutation))
        }
        DbOp::GetPackageFiles { package } => {
            let files = models::File::for_package(package, conn)?;
            Ok((DbReply::Files(files), None))
        }
        DbOp::GetProject { package } => {
            let pkg = match models::Package::get(package, conn)? {
                Some(pkg) => pkg,
                None => return Ok((DbReply::Project(None), None)),
            };
            let mut versions = Vec::new();
            for version in models::Version::for_package(pkg.id, conn)? {
                let files = models::File::for_version(version.id, conn)?;
                versions.push(ProjectVersion {
                    version: version.version,
                    released_at: version.released_at,
                    skip: version.skip,
                    files,
                });
            }
            Ok((
                DbReply::Project(Some(ProjectData {
                    package: pkg.name,
                    skip: pkg.skip,
                    versions,
                })),
                None,
            ))
        }
        DbOp::RootListing => {
            let names = models::Package::root_listing(conn)?;
            Ok((DbReply::Names(names), None))
        }
        DbOp::AllPackages => {
            let names = models::Package::list_names(conn)?;
            Ok((DbReply::Names(names), None))
        }
        DbOp::AllVersions => {
            let pairs = models::Version::all(conn)?;
            Ok((DbReply::Pairs(pairs), None))
        }
        DbOp::PackageExists { package, version } => {
            let found = match models::Package::get(package, conn)? {
                None => false,
                Some(pkg) => match version {
                    None => true,
                    Some(version) => models::Version::get(pkg.id, version, conn)?.is_some(),
                },
            };
            Ok((DbReply::Bool(found), None))
        }
        DbOp::GetStatistics => {
            let stats = models::collect_statistics(conn)?;
            Ok((DbReply::Stats(stats), None))
        }
        DbOp::LogDownloads { records } => {
            let rows: Vec<models::NewDownload> = records
                .iter()
                .cloned()
                .map(models::NewDownload::from_record)
                .collect();
            models::NewDownload::insert_batch(&rows, conn)?;
            Ok((DbReply::Unit, None))
        }
        DbOp::GetBuild { id } => {
            let build = models::Build::detail(*id, conn)?;
            Ok((DbReply::Build(build), None))
        }
        DbOp::DeleteBuild { id } => {
            let deleted = models::Build::delete(*id, conn)?;
            let mutation = deleted.as_ref().map(|deleted| Mutation::BuildDeleted {
                package: deleted.package.clone(),
                package_has_files: deleted.package_has_files,
            });
            Ok((DbReply::Deleted(deleted), mutation))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use wheelhouse_common::{Dependency, DependencyTool, WheelTags};

    fn ts(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn wheel(filename: &str) -> WheelFile {
        WheelFile {
            filename: filename.to_string(),
            filesize: 42,
            filehash: "0".repeat(64),
            tags: WheelTags::from_filename(filename).unwrap(),
            dependencies: vec![Dependency {
                tool: DependencyTool::Apt,
                dependency: "libatlas3-base".to_string(),
            }],
        }
    }

    fn record(package: &str, version: &str, status: BuildStatus, files: Vec<WheelFile>) -> BuildRecord {
        BuildRecord {
            package: package.to_string(),
            version: version.to_string(),
            abi_tag: "cp39m".to_string(),
            built_by: Some("test-slave".to_string()),
            duration_ms: 7_000,
            status,
            started_at: ts(10),
            output: "build log".to_string(),
            files,
        }
    }

    struct TestPool {
        client: DbClient,
        mutations: mpsc::UnboundedReceiver<Mutation>,
        shutdown: CancellationToken,
        _dir: tempfile::TempDir,
    }

    fn pool() -> TestPool {
        let dir = tempfile::tempdir().unwrap();
        let url = dir.path().join("test.db").to_str().unwrap().to_string();
        let shutdown = CancellationToken::new();
        let (client, mutations) = spawn(&url, 2, shutdown.clone()).unwrap();
        TestPool {
            client,
            mutations,
            shutdown,
            _dir: dir,
        }
    }

    async fn seed(client: &DbClient) {
        assert!(client.add_new_package("foo", "", ts(1)).await.unwrap());
        assert!(client.add_new_package("bar", "", ts(1)).await.unwrap());
        assert!(client
            .add_new_package_version("foo", "1.0", ts(2), "")
            .await
            .unwrap());
        assert!(client
            .add_new_package_version("bar", "0.5", ts(2), "")
            .await
            .unwrap());
        assert!(client
            .add_new_package_version("foo", "1.1", ts(3), "")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn pending_orders_by_release_then_name() {
        let pool = pool();
        seed(&pool.client).await;

        let pending = pool.client.get_pending_builds("cp39m", 10).await.unwrap();
        assert_eq!(
            pending,
            vec![
                ("bar".to_string(), "0.5".to_string()),
                ("foo".to_string(), "1.0".to_string()),
                ("foo".to_string(), "1.1".to_string()),
            ]
        );
        pool.shutdown.cancel();
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let pool = pool();
        seed(&pool.client).await;

        assert!(!pool.client.add_new_package("foo", "", ts(5)).await.unwrap());
        assert!(!pool
            .client
            .add_new_package_version("foo", "1.0", ts(5), "")
            .await
            .unwrap());
        let pending = pool.client.get_pending_builds("cp39m", 10).await.unwrap();
        assert_eq!(pending.len(), 3);
        pool.shutdown.cancel();
    }

    #[tokio::test]
    async fn version_for_unknown_package_is_refused() {
        let pool = pool();
        let err = pool
            .client
            .add_new_package_version("ghost", "1.0", ts(1), "")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Other(_)));
        pool.shutdown.cancel();
    }

    #[tokio::test]
    async fn successful_build_commits_everything_and_closes_the_slot() {
        let mut pool = pool();
        seed(&pool.client).await;

        let build_id = pool
            .client
            .log_build(record(
                "foo",
                "1.0",
                BuildStatus::Success,
                vec![wheel("foo-1.0-cp39-cp39-linux_armv7l.whl")],
            ))
            .await
            .unwrap()
            .unwrap();

        let pending = pool.client.get_pending_builds("cp39m", 10).await.unwrap();
        assert!(!pending.contains(&("foo".to_string(), "1.0".to_string())));
        // Another ABI still wants it.
        let pending_other = pool.client.get_pending_builds("cp311", 10).await.unwrap();
        assert!(pending_other.contains(&("foo".to_string(), "1.0".to_string())));

        let files = pool.client.get_package_files("foo").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].build_id, build_id);

        let detail = pool.client.get_build(build_id).await.unwrap().unwrap();
        assert_eq!(detail.package, "foo");
        assert_eq!(detail.files, vec!["foo-1.0-cp39-cp39-linux_armv7l.whl"]);

        let stats = pool.client.get_statistics().await.unwrap();
        assert_eq!(stats.builds_succeeded, 1);
        assert_eq!(stats.files_count, 1);

        assert!(matches!(
            pool.mutations.try_recv(),
            Ok(Mutation::PackageAdded { .. })
        ));
        pool.shutdown.cancel();
    }

    #[tokio::test]
    async fn failed_build_keeps_the_version_pending() {
        let pool = pool();
        seed(&pool.client).await;

        pool.client
            .log_build(record("foo", "1.0", BuildStatus::Failure, vec![]))
            .await
            .unwrap()
            .unwrap();

        let pending = pool.client.get_pending_builds("cp39m", 10).await.unwrap();
        assert!(pending.contains(&("foo".to_string(), "1.0".to_string())));
        let stats = pool.client.get_statistics().await.unwrap();
        assert_eq!(stats.builds_failed, 1);
        assert_eq!(stats.files_count, 0);
        pool.shutdown.cancel();
    }

    #[tokio::test]
    async fn empty_successful_build_closes_the_slot() {
        let pool = pool();
        seed(&pool.client).await;

        pool.client
            .log_build(record("foo", "1.0", BuildStatus::Success, vec![]))
            .await
            .unwrap()
            .unwrap();

        let pending = pool.client.get_pending_builds("cp39m", 10).await.unwrap();
        assert!(!pending.contains(&("foo".to_string(), "1.0".to_string())));
        pool.shutdown.cancel();
    }

    #[tokio::test]
    async fn skip_hides_versions_and_discards_late_builds() {
        let pool = pool();
        seed(&pool.client).await;

        assert!(pool
            .client
            .skip_package_version("foo", "1.0", "bad-build")
            .await
            .unwrap());
        assert!(pool.client.skip_package("bar", "explodes").await.unwrap());

        let pending = pool.client.get_pending_builds("cp39m", 10).await.unwrap();
        assert_eq!(pending, vec![("foo".to_string(), "1.1".to_string())]);

        // A build that raced the skip is discarded without a trace.
        let discarded = pool
            .client
            .log_build(record(
                "foo",
                "1.0",
                BuildStatus::Success,
                vec![wheel("foo-1.0-cp39-cp39-linux_armv7l.whl")],
            ))
            .await
            .unwrap();
        assert_eq!(discarded, None);
        let stats = pool.client.get_statistics().await.unwrap();
        assert_eq!(stats.builds_count, 0);

        pool.shutdown.cancel();
    }

    #[tokio::test]
    async fn unknown_targets_cannot_be_skipped() {
        let pool = pool();
        seed(&pool.client).await;
        assert!(!pool.client.skip_package("ghost", "why").await.unwrap());
        assert!(!pool
            .client
            .skip_package_version("foo", "9.9", "why")
            .await
            .unwrap());
        pool.shutdown.cancel();
    }

    #[tokio::test]
    async fn delete_build_cascades_and_reports_disk_state() {
        let mut pool = pool();
        seed(&pool.client).await;

        let build_id = pool
            .client
            .log_build(record(
                "foo",
                "1.0",
                BuildStatus::Success,
                vec![wheel("foo-1.0-cp39-cp39-linux_armv7l.whl")],
            ))
            .await
            .unwrap()
            .unwrap();

        let deleted = pool.client.delete_build(build_id).await.unwrap().unwrap();
        assert_eq!(deleted.package, "foo");
        assert_eq!(
            deleted.filenames,
            vec!["foo-1.0-cp39-cp39-linux_armv7l.whl"]
        );
        assert!(!deleted.package_has_files);

        assert!(pool.client.get_package_files("foo").await.unwrap().is_empty());
        let stats = pool.client.get_statistics().await.unwrap();
        assert_eq!(stats.files_count, 0);
        assert_eq!(stats.builds_count, 0);
        // Deleting again is a clean miss.
        assert!(pool.client.delete_build(build_id).await.unwrap().is_none());

        let mutations: Vec<Mutation> = std::iter::from_fn(|| pool.mutations.try_recv().ok()).collect();
        assert!(mutations
            .iter()
            .any(|m| matches!(m, Mutation::BuildLogged { package } if package == "foo")));
        assert!(mutations
            .iter()
            .any(|m| matches!(m, Mutation::BuildDeleted { package, package_has_files: false } if package == "foo")));
        pool.shutdown.cancel();
    }

    #[tokio::test]
    async fn project_view_collects_versions_and_files() {
        let pool = pool();
        seed(&pool.client).await;
        pool.client
            .log_build(record(
                "foo",
                "1.0",
                BuildStatus::Success,
                vec![wheel("foo-1.0-cp39-cp39-linux_armv7l.whl")],
            ))
            .await
            .unwrap();

        let project = pool.client.get_project("foo").await.unwrap().unwrap();
        assert_eq!(project.package, "foo");
        assert_eq!(project.versions.len(), 2);
        assert_eq!(project.versions[0].files.len(), 1);
        assert_eq!(project.versions[1].files.len(), 0);

        assert!(pool.client.get_project("ghost").await.unwrap().is_none());

        let root = pool.client.root_listing().await.unwrap();
        assert_eq!(root, vec!["foo".to_string()]);
        pool.shutdown.cancel();
    }
}
