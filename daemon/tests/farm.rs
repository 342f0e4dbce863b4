//! End-to-end exercises of the master over real sockets: a scripted slave
//! connects, builds, uploads, and the database plus the on-disk index are
//! checked afterwards.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use wheelhouse_common::proto::import::{ImportReply, ImportRequest};
use wheelhouse_common::proto::slave::{MasterReply, SlaveRequest};
use wheelhouse_common::proto::transfer::{upload_file, DoneCode};
use wheelhouse_common::proto;
use wheelhouse_common::{BuildStatus, WheelFile, WheelTags};
use wheelhoused::config::{Config, ConfigFile};
use wheelhoused::db::DbClient;
use wheelhoused::dispatch::DispatchMsg;
use wheelhoused::{db, dispatch, import, index, indexer, recorder, transfer};

struct Farm {
    config: Arc<Config>,
    db: DbClient,
    dispatch_tx: tokio::sync::mpsc::Sender<DispatchMsg>,
    slave_addr: SocketAddr,
    file_addr: SocketAddr,
    import_addr: SocketAddr,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

async fn boot() -> Farm {
    let dir = tempfile::tempdir().unwrap();
    let mut file = ConfigFile::default();
    file.paths.output = dir.path().join("www");
    file.database.url = dir.path().join("farm.db").to_str().unwrap().to_string();
    file.database.workers = 2;
    file.sockets.slave = "127.0.0.1:0".to_string();
    file.sockets.file = "127.0.0.1:0".to_string();
    file.sockets.import = "127.0.0.1:0".to_string();
    file.index.write_cycle_ms = 25;
    let config = Arc::new(Config::from_file(file).unwrap());
    std::fs::create_dir_all(&config.output_path).unwrap();

    let shutdown = CancellationToken::new();
    let (db, mutations) = db::spawn(&config.db_url, config.db_workers, shutdown.clone()).unwrap();
    let (scribe_tx, _scribe) =
        index::Scribe::spawn(config.clone(), db.clone(), shutdown.clone()).unwrap();
    let _indexer = indexer::spawn(mutations, scribe_tx.clone(), shutdown.clone());
    let (transfers, file_addr, _transfer) = transfer::spawn(config.clone(), shutdown.clone())
        .await
        .unwrap();
    let (_recorder_tx, _recorder) = recorder::spawn(db.clone(), shutdown.clone());
    let (dispatch_tx, slave_addr, _dispatch) =
        dispatch::SlaveDriver::spawn(config.clone(), db.clone(), transfers.clone(), shutdown.clone())
            .await
            .unwrap();
    let (import_addr, _import) =
        import::spawn(config.clone(), db.clone(), transfers.clone(), shutdown.clone())
            .await
            .unwrap();

    Farm {
        config,
        db,
        dispatch_tx,
        slave_addr,
        file_addr,
        import_addr,
        shutdown,
        _dir: dir,
    }
}

struct TestSlave {
    stream: BufStream<TcpStream>,
    slave_id: u32,
}

impl TestSlave {
    async fn connect(farm: &Farm, label: &str, abi: &str) -> TestSlave {
        let stream = TcpStream::connect(farm.slave_addr).await.unwrap();
        let mut stream = BufStream::new(stream);
        proto::send(
            &mut stream,
            &SlaveRequest::Hello {
                timestamp: Utc::now().naive_utc(),
                label: label.to_string(),
                abi_tag: abi.to_string(),
                platform_tag: "linux_armv7l".to_string(),
                py_tag: "cp39".to_string(),
                os_name: "linux".to_string(),
                os_version: "11".to_string(),
                board_revision: "c03111".to_string(),
                board_serial: "0000".to_string(),
            },
        )
        .await
        .unwrap();
        let slave_id = match proto::recv(&mut stream).await.unwrap().unwrap() {
            MasterReply::Hello { slave_id, .. } => slave_id,
            other => panic!("expected hello, got {:?}", other),
        };
        TestSlave { stream, slave_id }
    }

    async fn send(&mut self, request: SlaveRequest) -> MasterReply {
        proto::send(&mut self.stream, &request).await.unwrap();
        proto::recv(&mut self.stream).await.unwrap().unwrap()
    }
}

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn wheel_for(filename: &str, data: &[u8]) -> WheelFile {
    WheelFile {
        filename: filename.to_string(),
        filesize: data.len() as u64,
        filehash: hex::encode(Sha256::digest(data)),
        tags: WheelTags::from_filename(filename).unwrap(),
        dependencies: vec![],
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn write_payload(dir: &tempfile::TempDir, filename: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(filename);
    std::fs::write(&path, data).unwrap();
    path
}

#[tokio::test]
async fn fresh_build_lands_on_disk_in_db_and_in_the_index() {
    let farm = boot().await;
    let now = Utc::now().naive_utc();
    farm.db.add_new_package("foo", "", now).await.unwrap();
    farm.db
        .add_new_package_version("foo", "1.0", now, "")
        .await
        .unwrap();

    let mut slave = TestSlave::connect(&farm, "pi-1", "cp39m").await;
    match slave.send(SlaveRequest::Idle).await {
        MasterReply::Build { package, version } => {
            assert_eq!(package, "foo");
            assert_eq!(version, "1.0");
        }
        other => panic!("expected build, got {:?}", other),
    }

    // Mid-build heartbeat keeps the assignment alive.
    assert_eq!(slave.send(SlaveRequest::Busy).await, MasterReply::Cont);

    let data = payload(200_000);
    let filename = "foo-1.0-cp39-cp39-linux_armv7l.whl";
    let wheel = wheel_for(filename, &data);
    let staging = tempfile::tempdir().unwrap();
    let wheel_path = write_payload(&staging, filename, &data);

    match slave
        .send(SlaveRequest::Built {
            status: BuildStatus::Success,
            duration_ms: 7_000,
            output: "collected 1 wheel\n".to_string(),
            files: vec![wheel.clone()],
        })
        .await
    {
        MasterReply::Send { filename: wanted } => assert_eq!(wanted, filename),
        other => panic!("expected send, got {:?}", other),
    }

    let code = upload_file(&farm.file_addr.to_string(), slave.slave_id, &wheel_path)
        .await
        .unwrap();
    assert_eq!(code, DoneCode::Ok);
    assert_eq!(slave.send(SlaveRequest::Sent).await, MasterReply::Done);

    // Artifact installed atomically under simple/<pkg>/.
    let installed = farm.config.simple_path().join("foo").join(filename);
    assert_eq!(std::fs::read(&installed).unwrap(), data);

    // One attempt, one file, nothing pending for this ABI.
    let files = farm.db.get_package_files("foo").await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].filehash, wheel.filehash);
    assert!(farm
        .db
        .get_pending_builds("cp39m", 10)
        .await
        .unwrap()
        .is_empty());

    // The index writer catches up shortly after.
    let package_index = farm.config.simple_path().join("foo").join("index.html");
    wait_for("package index", || package_index.exists()).await;
    let body = std::fs::read_to_string(&package_index).unwrap();
    assert!(body.contains(filename));
    let root_index = farm.config.simple_path().join("index.html");
    wait_for("root index", || {
        root_index.exists()
            && std::fs::read_to_string(&root_index)
                .unwrap()
                .contains("foo")
    })
    .await;

    farm.shutdown.cancel();
}

#[tokio::test]
async fn failed_build_is_recorded_and_stays_pending() {
    let farm = boot().await;
    let now = Utc::now().naive_utc();
    farm.db.add_new_package("foo", "", now).await.unwrap();
    farm.db
        .add_new_package_version("foo", "1.0", now, "")
        .await
        .unwrap();

    let mut slave = TestSlave::connect(&farm, "pi-1", "cp39m").await;
    assert!(matches!(
        slave.send(SlaveRequest::Idle).await,
        MasterReply::Build { .. }
    ));
    assert_eq!(
        slave
            .send(SlaveRequest::Built {
                status: BuildStatus::Failure,
                duration_ms: 3_000,
                output: "gcc: error\n".to_string(),
                files: vec![],
            })
            .await,
        MasterReply::Done
    );

    let stats = farm.db.get_statistics().await.unwrap();
    assert_eq!(stats.builds_failed, 1);
    assert_eq!(stats.files_count, 0);
    // Still pending for the next slave.
    let pending = farm.db.get_pending_builds("cp39m", 10).await.unwrap();
    assert_eq!(pending, vec![("foo".to_string(), "1.0".to_string())]);

    farm.shutdown.cancel();
}

#[tokio::test]
async fn two_slaves_get_distinct_builds() {
    let farm = boot().await;
    let now = Utc::now().naive_utc();
    farm.db.add_new_package("foo", "", now).await.unwrap();
    farm.db
        .add_new_package_version("foo", "1.0", now, "")
        .await
        .unwrap();
    farm.db
        .add_new_package_version("foo", "2.0", now, "")
        .await
        .unwrap();

    let mut first = TestSlave::connect(&farm, "pi-1", "cp39m").await;
    let mut second = TestSlave::connect(&farm, "pi-2", "cp39m").await;

    let a = match first.send(SlaveRequest::Idle).await {
        MasterReply::Build { package, version } => (package, version),
        other => panic!("expected build, got {:?}", other),
    };
    let b = match second.send(SlaveRequest::Idle).await {
        MasterReply::Build { package, version } => (package, version),
        other => panic!("expected build, got {:?}", other),
    };
    assert_ne!(a, b, "both slaves were handed the same build");

    // A third slave has nothing left and is put to sleep.
    let mut third = TestSlave::connect(&farm, "pi-3", "cp39m").await;
    assert!(matches!(
        third.send(SlaveRequest::Idle).await,
        MasterReply::Sleep { .. }
    ));

    farm.shutdown.cancel();
}

#[tokio::test]
async fn sleep_backoff_grows_and_caps() {
    let farm = boot().await;
    let mut slave = TestSlave::connect(&farm, "pi-1", "cp39m").await;

    let mut last = 0;
    for expected in [10u64, 20, 40] {
        match slave.send(SlaveRequest::Idle).await {
            MasterReply::Sleep { seconds } => {
                assert_eq!(seconds, expected);
                last = seconds;
            }
            other => panic!("expected sleep, got {:?}", other),
        }
    }
    assert_eq!(last, 40);

    farm.shutdown.cancel();
}

#[tokio::test]
async fn skipped_version_is_aborted_and_late_result_discarded() {
    let farm = boot().await;
    let now = Utc::now().naive_utc();
    farm.db.add_new_package("foo", "", now).await.unwrap();
    farm.db
        .add_new_package_version("foo", "1.0", now, "")
        .await
        .unwrap();

    let mut slave = TestSlave::connect(&farm, "pi-1", "cp39m").await;
    assert!(matches!(
        slave.send(SlaveRequest::Idle).await,
        MasterReply::Build { .. }
    ));

    // Deprecated mid-build: skip in the DB, abort in dispatch.
    farm.db
        .skip_package_version("foo", "1.0", "bad-build")
        .await
        .unwrap();
    farm.dispatch_tx
        .send(DispatchMsg::Abort {
            package: "foo".to_string(),
            version: Some("1.0".to_string()),
        })
        .await
        .unwrap();

    // The next heartbeat tells the slave to stop; nothing is recorded.
    assert_eq!(slave.send(SlaveRequest::Busy).await, MasterReply::Done);
    let stats = farm.db.get_statistics().await.unwrap();
    assert_eq!(stats.builds_count, 0);
    assert!(farm
        .db
        .get_pending_builds("cp39m", 10)
        .await
        .unwrap()
        .is_empty());

    farm.shutdown.cancel();
}

#[tokio::test]
async fn protocol_violation_retires_the_slave_and_requeues() {
    let farm = boot().await;
    let now = Utc::now().naive_utc();
    farm.db.add_new_package("foo", "", now).await.unwrap();
    farm.db
        .add_new_package_version("foo", "1.0", now, "")
        .await
        .unwrap();

    let mut slave = TestSlave::connect(&farm, "pi-1", "cp39m").await;
    assert!(matches!(
        slave.send(SlaveRequest::Idle).await,
        MasterReply::Build { .. }
    ));
    // Claiming to be idle while holding an assignment is a violation.
    assert_eq!(slave.send(SlaveRequest::Idle).await, MasterReply::Die);

    // The requeued build goes to the next slave.
    let mut replacement = TestSlave::connect(&farm, "pi-2", "cp39m").await;
    assert!(matches!(
        replacement.send(SlaveRequest::Idle).await,
        MasterReply::Build { .. }
    ));

    farm.shutdown.cancel();
}

#[tokio::test]
async fn import_registers_an_external_wheel() {
    let farm = boot().await;

    let data = payload(80_000);
    let filename = "bar-2.0-cp39-cp39-linux_armv7l.whl";
    let wheel = wheel_for(filename, &data);
    let staging = tempfile::tempdir().unwrap();
    write_payload(&staging, filename, &data);

    let stream = TcpStream::connect(farm.import_addr).await.unwrap();
    let mut stream = BufStream::new(stream);
    proto::send(
        &mut stream,
        &ImportRequest::Import {
            package: "bar".to_string(),
            version: "2.0".to_string(),
            abi_tag: "cp39m".to_string(),
            built_by: "importer".to_string(),
            duration_ms: 0,
            output: "imported\n".to_string(),
            files: vec![wheel.clone()],
        },
    )
    .await
    .unwrap();

    let build_id = loop {
        let reply: ImportReply = proto::recv(&mut stream).await.unwrap().unwrap();
        match reply {
            ImportReply::Send { slave_id, filename } => {
                let path = staging.path().join(&filename);
                let code = upload_file(&farm.file_addr.to_string(), slave_id, &path)
                    .await
                    .unwrap();
                assert_eq!(code, DoneCode::Ok);
                proto::send(&mut stream, &ImportRequest::Sent).await.unwrap();
            }
            ImportReply::Done { build_id } => break build_id,
            ImportReply::Error { message } => panic!("import refused: {}", message),
        }
    };

    let installed = farm.config.simple_path().join("bar").join(filename);
    assert_eq!(std::fs::read(&installed).unwrap(), data);
    let detail = farm.db.get_build(build_id).await.unwrap().unwrap();
    assert_eq!(detail.package, "bar");
    assert_eq!(detail.built_by.as_deref(), Some("importer"));
    // Imported versions do not linger in the queue.
    assert!(farm
        .db
        .get_pending_builds("cp39m", 10)
        .await
        .unwrap()
        .is_empty());

    farm.shutdown.cancel();
}
