use serde::{Deserialize, Serialize};

/// Wire-level membership request sent by a rank when joining a collective group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub rank: usize,
    pub world_size: usize,
}

/// The reasons the rendezvous endpoint may refuse a `JoinSpec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    WorldSizeMismatch { expected: usize, got: usize },
    RankOutOfRange { rank: usize, world_size: usize },
    DuplicateRank { rank: usize },
    UnexpectedMessage { got: String },
}
