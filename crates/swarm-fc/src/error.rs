use std::time::Duration;

use swarm_proto::telemetry::TelemetryKind;

use crate::dispatch::CommandKind;
use crate::link::LinkStatus;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    #[error("endpoint unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("no heartbeat within {waited:?}")]
    NoHeartbeat { waited: Duration },
}

impl ConnectionError {
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable { reason: reason.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("link to vehicle lost")]
pub struct LinkLost;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("refusing {command:?}: link is {status:?}")]
    NotConnected { command: CommandKind, status: LinkStatus },

    #[error("{0:?} already pending")]
    CommandAlreadyPending(CommandKind),

    #[error(transparent)]
    LinkLost(#[from] LinkLost),
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("no matching {kind:?} telemetry within {waited:?}")]
pub struct TelemetryTimeout {
    pub kind: TelemetryKind,
    pub waited: Duration,
}
