use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use wheelhouse_common::errors::*;

/// On-disk configuration. Every section is optional; the defaults run a
/// single-host farm out of the working directory.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub sockets: SocketsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub transfers: TransfersConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_url")]
    pub url: String,
    #[serde(default = "default_db_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_output")]
    pub output: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocketsConfig {
    #[serde(default = "default_slave_bind")]
    pub slave: String,
    #[serde(default = "default_file_bind")]
    pub file: String,
    #[serde(default = "default_log_bind")]
    pub log: String,
    #[serde(default = "default_status_bind")]
    pub status: String,
    #[serde(default = "default_control_bind")]
    pub control: String,
    #[serde(default = "default_import_bind")]
    pub import: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_abis")]
    pub abis: Vec<String>,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_pending_limit")]
    pub pending_limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_upstream")]
    pub upstream: String,
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_refresh_batch")]
    pub refresh_batch: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_write_cycle")]
    pub write_cycle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_stats_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransfersConfig {
    #[serde(default = "default_transfer_retries")]
    pub retries: u32,
}

fn default_db_url() -> String {
    "wheelhouse.db".to_string()
}

fn default_db_workers() -> usize {
    3
}

fn default_output() -> PathBuf {
    PathBuf::from("wheelhouse")
}

fn default_slave_bind() -> String {
    "0.0.0.0:5555".to_string()
}

fn default_file_bind() -> String {
    "0.0.0.0:5556".to_string()
}

fn default_log_bind() -> String {
    "127.0.0.1:5557".to_string()
}

fn default_status_bind() -> String {
    "127.0.0.1:5558".to_string()
}

fn default_control_bind() -> String {
    "127.0.0.1:5559".to_string()
}

fn default_import_bind() -> String {
    "127.0.0.1:5560".to_string()
}

fn default_abis() -> Vec<String> {
    vec!["cp39m".to_string()]
}

fn default_busy_timeout() -> u64 {
    3 * 60 * 60
}

fn default_idle_timeout() -> u64 {
    60 * 60
}

fn default_pending_limit() -> i64 {
    100
}

fn default_upstream() -> String {
    "https://pypi.org".to_string()
}

fn default_sync_interval() -> u64 {
    5 * 60
}

fn default_refresh_batch() -> usize {
    50
}

fn default_write_cycle() -> u64 {
    1000
}

fn default_stats_interval() -> u64 {
    60
}

fn default_transfer_retries() -> u32 {
    wheelhouse_common::config::TRANSFER_RETRIES
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: default_db_url(),
            workers: default_db_workers(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            output: default_output(),
        }
    }
}

impl Default for SocketsConfig {
    fn default() -> Self {
        SocketsConfig {
            slave: default_slave_bind(),
            file: default_file_bind(),
            log: default_log_bind(),
            status: default_status_bind(),
            control: default_control_bind(),
            import: default_import_bind(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            abis: default_abis(),
            busy_timeout_secs: default_busy_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            pending_limit: default_pending_limit(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            upstream: default_upstream(),
            interval_secs: default_sync_interval(),
            refresh_batch: default_refresh_batch(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            write_cycle_ms: default_write_cycle(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        StatusConfig {
            interval_secs: default_stats_interval(),
        }
    }
}

impl Default for TransfersConfig {
    fn default() -> Self {
        TransfersConfig {
            retries: default_transfer_retries(),
        }
    }
}

/// Validated runtime configuration, passed immutably into every actor.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub db_workers: usize,
    pub output_path: PathBuf,
    pub slave_bind: String,
    pub file_bind: String,
    pub log_bind: String,
    pub status_bind: String,
    pub control_bind: String,
    pub import_bind: String,
    pub abis: Vec<String>,
    pub busy_timeout: Duration,
    pub idle_timeout: Duration,
    pub pending_limit: i64,
    pub upstream: String,
    pub sync_interval: Duration,
    pub refresh_batch: usize,
    pub write_cycle: Duration,
    pub stats_interval: Duration,
    pub transfer_retries: u32,
}

impl Config {
    pub fn from_file(file: ConfigFile) -> Result<Config> {
        if file.dispatch.abis.is_empty() {
            bail!("At least one build ABI must be configured");
        }
        if file.database.workers == 0 {
            bail!("At least one database worker is required");
        }
        if file.dispatch.pending_limit <= 0 {
            bail!("dispatch.pending_limit must be positive");
        }
        Ok(Config {
            db_url: file.database.url,
            db_workers: file.database.workers,
            output_path: file.paths.output,
            slave_bind: file.sockets.slave,
            file_bind: file.sockets.file,
            log_bind: file.sockets.log,
            status_bind: file.sockets.status,
            control_bind: file.sockets.control,
            import_bind: file.sockets.import,
            abis: file.dispatch.abis,
            busy_timeout: Duration::from_secs(file.dispatch.busy_timeout_secs),
            idle_timeout: Duration::from_secs(file.dispatch.idle_timeout_secs),
            pending_limit: file.dispatch.pending_limit,
            upstream: file.sync.upstream,
            sync_interval: Duration::from_secs(file.sync.interval_secs),
            refresh_batch: file.sync.refresh_batch,
            write_cycle: Duration::from_millis(file.index.write_cycle_ms),
            stats_interval: Duration::from_secs(file.status.interval_secs),
            transfer_retries: file.transfers.retries,
        })
    }

    pub fn simple_path(&self) -> PathBuf {
        self.output_path.join("simple")
    }

    pub fn project_path(&self) -> PathBuf {
        self.output_path.join("project")
    }

    pub fn tmp_path(&self) -> PathBuf {
        self.output_path.join("tmp")
    }
}

pub fn load(path: Option<&std::path::Path>) -> Result<Config> {
    let file: ConfigFile =
        wheelhouse_common::config::load(path, "/etc/wheelhouse/master.conf")?;
    Config::from_file(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::from_file(ConfigFile::default()).unwrap();
        assert_eq!(config.db_workers, 3);
        assert_eq!(config.abis, vec!["cp39m".to_string()]);
        assert!(config.busy_timeout > config.idle_timeout);
    }

    #[test]
    fn rejects_empty_abi_list() {
        let mut file = ConfigFile::default();
        file.dispatch.abis.clear();
        assert!(Config::from_file(file).is_err());
    }

    #[test]
    fn parses_partial_config() {
        let file: ConfigFile = toml::from_str(
            r#"
            [dispatch]
            abis = ["cp311", "cp39m"]
            busy_timeout_secs = 600

            [sync]
            upstream = "https://mirror.example.org"
            "#,
        )
        .unwrap();
        let config = Config::from_file(file).unwrap();
        assert_eq!(config.abis.len(), 2);
        assert_eq!(config.busy_timeout, Duration::from_secs(600));
        assert_eq!(config.upstream, "https://mirror.example.org");
        assert_eq!(config.db_workers, 3);
    }
}
