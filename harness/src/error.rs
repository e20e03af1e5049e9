use std::{error::Error, fmt, io, path::PathBuf};

use comms::specs::group::Rejection;

/// The harness module's result type.
pub type Result<T> = std::result::Result<T, HarnessErr>;

/// Failures of the collective-group bootstrap, each fatal for the rank that observes it.
#[derive(Debug)]
pub enum RendezvousErr {
    /// Rank 0 could not host the endpoint at the rendezvous address.
    Bind { addr: String, source: io::Error },
    /// The endpoint did not accept a connection before the connect timeout elapsed.
    Unreachable { addr: String, source: io::Error },
    WorldSizeMismatch { expected: usize, got: usize },
    DuplicateRank { rank: usize },
    /// The endpoint refused the join for some other reason.
    Rejected(String),
    /// A peer left the group without tearing down, the group can't make progress.
    PeerLost(String),
    /// A collective did not complete within the configured timeout.
    Timeout { op: &'static str },
    Protocol(String),
    /// The operation is not valid in the group's current phase.
    InvalidState {
        op: &'static str,
        phase: &'static str,
    },
    Io(io::Error),
}

impl fmt::Display for RendezvousErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { addr, source } => write!(f, "cannot host rendezvous at {addr}: {source}"),
            Self::Unreachable { addr, source } => {
                write!(f, "rendezvous endpoint {addr} unreachable: {source}")
            }
            Self::WorldSizeMismatch { expected, got } => write!(
                f,
                "world size mismatch: the group was created with {expected} ranks, joined with {got}"
            ),
            Self::DuplicateRank { rank } => write!(f, "rank {rank} already joined the group"),
            Self::Rejected(reason) => write!(f, "join rejected: {reason}"),
            Self::PeerLost(reason) => write!(f, "group aborted: {reason}"),
            Self::Timeout { op } => write!(f, "{op} timed out"),
            Self::Protocol(detail) => write!(f, "protocol violation: {detail}"),
            Self::InvalidState { op, phase } => write!(f, "cannot {op} while {phase}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for RendezvousErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Bind { source, .. } | Self::Unreachable { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RendezvousErr {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::PeerLost(format!("connection closed: {value}")),
            _ => Self::Io(value),
        }
    }
}

impl From<Rejection> for RendezvousErr {
    fn from(value: Rejection) -> Self {
        match value {
            Rejection::WorldSizeMismatch { expected, got } => {
                Self::WorldSizeMismatch { expected, got }
            }
            Rejection::DuplicateRank { rank } => Self::DuplicateRank { rank },
            Rejection::RankOutOfRange { rank, world_size } => {
                Self::Rejected(format!("rank {rank} out of range for world size {world_size}"))
            }
            Rejection::UnexpectedMessage { got } => {
                Self::Rejected(format!("expected a join request, got {got}"))
            }
        }
    }
}

/// Every failure the harness reports.
#[derive(Debug)]
pub enum HarnessErr {
    /// Invalid configuration, caught before any worker is spawned.
    Config(String),
    /// The job lacks the procedure its mode dispatches to.
    UnimplementedProcedure { procedure: &'static str },
    Rendezvous { rank: usize, source: RendezvousErr },
    /// Restoration was requested for an epoch with no checkpoint file.
    MissingCheckpoint { epoch: usize, path: PathBuf },
    CorruptCheckpoint { path: PathBuf, detail: String },
    /// A state dict does not fit the model or optimizer it is imported into.
    StateMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// The user factory failed to build the worker's artefacts.
    Artefacts(anyhow::Error),
    /// The user train/evaluate procedure failed.
    Procedure(anyhow::Error),
    /// A worker thread failed with `source`.
    Worker {
        rank: usize,
        source: Box<HarnessErr>,
    },
    /// A worker process exited unsuccessfully.
    WorkerFailed { rank: usize, detail: String },
    Io(io::Error),
}

/// The exit code of a worker process that failed because a peer left the group.
pub const PEER_LOST_EXIT: u8 = 3;

impl HarnessErr {
    /// Whether this failure is a consequence of another rank failing first.
    pub fn is_peer_lost(&self) -> bool {
        match self {
            Self::Rendezvous {
                source: RendezvousErr::PeerLost(_),
                ..
            } => true,
            Self::Worker { source, .. } => source.is_peer_lost(),
            _ => false,
        }
    }

    /// The code a worker process exits with when failing with this error.
    pub fn exit_code(&self) -> u8 {
        if self.is_peer_lost() {
            PEER_LOST_EXIT
        } else {
            1
        }
    }

    pub(crate) fn rendezvous(rank: usize, source: impl Into<RendezvousErr>) -> Self {
        Self::Rendezvous {
            rank,
            source: source.into(),
        }
    }
}

impl fmt::Display for HarnessErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Self::UnimplementedProcedure { procedure } => {
                write!(f, "the job does not implement `{procedure}`")
            }
            Self::Rendezvous { rank, source } => write!(f, "rank {rank}: {source}"),
            Self::MissingCheckpoint { epoch, path } => write!(
                f,
                "no checkpoint for epoch {epoch} at {}",
                path.display()
            ),
            Self::CorruptCheckpoint { path, detail } => {
                write!(f, "corrupt checkpoint {}: {detail}", path.display())
            }
            Self::StateMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "{what} state size mismatch: got {got}, expected {expected}"
            ),
            Self::Artefacts(e) => write!(f, "failed to build artefacts: {e:#}"),
            Self::Procedure(e) => write!(f, "job procedure failed: {e:#}"),
            Self::Worker { rank, source } => write!(f, "worker {rank} failed: {source}"),
            Self::WorkerFailed { rank, detail } => write!(f, "worker {rank} failed: {detail}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for HarnessErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Rendezvous { source, .. } => Some(source),
            Self::Artefacts(e) | Self::Procedure(e) => Some(&**e),
            Self::Worker { source, .. } => Some(&**source),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HarnessErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for HarnessErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_connections_are_peer_loss() {
        let err = RendezvousErr::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, RendezvousErr::PeerLost(_)));

        let err = RendezvousErr::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, RendezvousErr::Io(_)));
    }

    #[test]
    fn rendezvous_errors_name_the_rank() {
        let err = HarnessErr::rendezvous(3, Rejection::DuplicateRank { rank: 3 });
        assert_eq!(err.to_string(), "rank 3: rank 3 already joined the group");
    }

    #[test]
    fn peer_loss_is_a_secondary_failure() {
        let lost = HarnessErr::rendezvous(1, RendezvousErr::PeerLost("rank 0 left".to_string()));
        assert!(lost.is_peer_lost());
        assert_eq!(lost.exit_code(), PEER_LOST_EXIT);

        let wrapped = HarnessErr::Worker {
            rank: 1,
            source: Box::new(lost),
        };
        assert!(wrapped.is_peer_lost());

        let missing = HarnessErr::MissingCheckpoint {
            epoch: 2,
            path: PathBuf::from("ckpt_2.safetensors"),
        };
        assert_eq!(missing.exit_code(), 1);
    }
}
