use crate::WheelFile;
use serde::{Deserialize, Serialize};

/// Submission of externally built wheels on the import socket. The payload
/// bytes follow over the transfer socket once the master answers `Send`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "kebab-case")]
pub enum ImportRequest {
    Import {
        package: String,
        version: String,
        abi_tag: String,
        built_by: String,
        duration_ms: u64,
        output: String,
        files: Vec<WheelFile>,
    },
    Sent,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "kebab-case")]
pub enum ImportReply {
    /// Stream this file through the transfer socket using the given id.
    Send { slave_id: u32, filename: String },
    Done { build_id: i32 },
    Error { message: String },
}
