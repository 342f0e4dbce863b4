use crate::{BuildStatus, WheelFile};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Messages a build slave may send on the dispatch socket. The exchange is
/// strictly request/response: the master never speaks first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "kebab-case")]
pub enum SlaveRequest {
    Hello {
        timestamp: NaiveDateTime,
        label: String,
        abi_tag: String,
        platform_tag: String,
        py_tag: String,
        os_name: String,
        os_version: String,
        board_revision: String,
        board_serial: String,
    },
    Idle,
    /// Mid-build heartbeat; keeps the slave out of the busy-timeout sweep and
    /// gives the master a chance to abort the running build.
    Busy,
    Built {
        status: BuildStatus,
        duration_ms: u64,
        output: String,
        #[serde(default)]
        files: Vec<WheelFile>,
    },
    Sent,
    Bye,
}

/// Replies the master sends on the dispatch socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "kebab-case")]
pub enum MasterReply {
    Hello {
        slave_id: u32,
        timestamp: NaiveDateTime,
    },
    Sleep {
        seconds: u64,
    },
    Build {
        package: String,
        version: String,
    },
    /// Carry on: re-poll shortly (reply to `Idle` while dispatch is paused)
    /// or keep building (reply to `Busy`).
    Cont,
    Die,
    Send {
        filename: String,
    },
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_round_trip_and_tag_cleanly() {
        let msg = SlaveRequest::Built {
            status: BuildStatus::Success,
            duration_ms: 7000,
            output: "ok".into(),
            files: vec![],
        };
        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains("\"msg\":\"built\""));
        assert_eq!(serde_json::from_str::<SlaveRequest>(&line).unwrap(), msg);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(serde_json::from_str::<SlaveRequest>(r#"{"msg":"reboot"}"#).is_err());
    }
}
