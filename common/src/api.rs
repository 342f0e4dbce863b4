use crate::errors::*;
use crate::proto::control::{ControlReply, ControlRequest, StatusEvent};
use crate::proto;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tokio::io::BufStream;
use tokio::net::TcpStream;

/// Database statistics broadcast to monitors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub packages_count: i64,
    pub packages_skipped: i64,
    pub versions_count: i64,
    pub versions_skipped: i64,
    pub builds_count: i64,
    pub builds_succeeded: i64,
    pub builds_failed: i64,
    pub build_ms_total: i64,
    pub files_count: i64,
    pub files_bytes: i64,
    pub downloads_count: i64,
    pub downloads_last_month: i64,
}

/// What a slave is doing right now, as tracked by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlavePhase {
    Idle,
    Building,
    Sending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveSummary {
    pub slave_id: u32,
    pub label: String,
    pub abi_tag: String,
    pub phase: SlavePhase,
    pub last_seen: NaiveDateTime,
    pub current_build: Option<(String, String)>,
}

/// One download served by the HTTP tier, as logged on the ingestion socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub filename: String,
    pub accessed_by: String,
    pub accessed_at: NaiveDateTime,
    pub arch: Option<String>,
    pub distro_name: Option<String>,
    pub distro_version: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub py_name: Option<String>,
    pub py_version: Option<String>,
}

/// Client for the master's control socket, used by wheelhousectl and tests.
pub struct Client {
    stream: BufStream<TcpStream>,
}

impl Client {
    pub async fn connect(addr: &str) -> Result<Client> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to control socket: {:?}", addr))?;
        Ok(Client {
            stream: BufStream::new(stream),
        })
    }

    pub async fn request(&mut self, request: &ControlRequest) -> Result<ControlReply> {
        proto::send(&mut self.stream, request).await?;
        let reply = proto::recv(&mut self.stream)
            .await?
            .ok_or_else(|| format_err!("Control connection closed before reply"))?;
        if let ControlReply::Error { message } = &reply {
            bail!("Master refused command: {}", message);
        }
        Ok(reply)
    }
}

/// Client for the master's status socket. The master pushes an initial
/// snapshot on connect and deltas from then on.
pub struct StatusStream {
    stream: BufStream<TcpStream>,
}

impl StatusStream {
    pub async fn connect(addr: &str) -> Result<StatusStream> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to status socket: {:?}", addr))?;
        Ok(StatusStream {
            stream: BufStream::new(stream),
        })
    }

    pub async fn next_event(&mut self) -> Result<Option<StatusEvent>> {
        Ok(proto::recv(&mut self.stream).await?)
    }
}
