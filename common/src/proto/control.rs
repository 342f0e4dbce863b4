use crate::api::{SlaveSummary, StatsSnapshot};
use serde::{Deserialize, Serialize};

/// Administrative commands accepted on the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum ControlRequest {
    Hello,
    /// Stop handing out new builds; connected slaves are parked with `Cont`.
    Pause,
    Resume,
    KillSlave {
        slave_id: u32,
    },
    Skip {
        package: String,
        version: Option<String>,
        reason: String,
    },
    Unskip {
        package: String,
        version: Option<String>,
    },
    /// Forget the recorded builds for a version (or a whole package) so the
    /// dispatch queue picks it up again.
    Rebuild {
        package: String,
        version: Option<String>,
    },
    Reload,
    GetStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "kebab-case")]
pub enum ControlReply {
    Ok,
    Error {
        message: String,
    },
    Hello {
        version: String,
    },
    Status {
        stats: StatsSnapshot,
        slaves: Vec<SlaveSummary>,
        paused: bool,
    },
    Reloaded {
        applied: Vec<String>,
        restart_required: Vec<String>,
    },
}

/// Events pushed on the status socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum StatusEvent {
    Stats { stats: StatsSnapshot },
    Slaves { slaves: Vec<SlaveSummary> },
    Paused { paused: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_commands_round_trip() {
        let cmd = ControlRequest::Skip {
            package: "foo".into(),
            version: Some("1.0".into()),
            reason: "bad-build".into(),
        };
        let line = serde_json::to_string(&cmd).unwrap();
        assert!(line.contains("\"cmd\":\"skip\""));
        assert_eq!(serde_json::from_str::<ControlRequest>(&line).unwrap(), cmd);
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(serde_json::from_str::<ControlRequest>(r#"{"cmd":"self-destruct"}"#).is_err());
    }
}
