#![warn(clippy::all)]

mod error;
mod raft;

pub use error::{Error, Result};
pub use raft::{
    AppendEntries, AppendEntriesResponse, Config, Entry, Envelope, Index, Log, Message, Node,
    NodeId, RequestVote, RequestVoteResponse, Status, Term, Timeout, TimeoutKind, Timestamp,
    ELECTION_TIMEOUT, ELECTION_TIMEOUT_JITTER, HEARTBEAT_INTERVAL,
};
