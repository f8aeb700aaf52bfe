//! A pure, transport-agnostic Raft consensus engine. Raft replicates a log of
//! arbitrary commands across a cluster of nodes, tolerating fail-stop
//! failures of a minority, and guarantees that committed entries are durable
//! and identical on all nodes. See the Raft paper for the protocol itself:
//! <https://raft.github.io/raft.pdf>
//!
//! The engine is the protocol brain only. It never performs IO: each entry
//! point takes the current node state and a monotonic clock reading, and
//! returns the next state along with a batch of outbound messages for the
//! host to transmit. The host owns the network transport, the event loop,
//! durable storage of `(term, vote, log)`, and the state machine that
//! consumes committed entries. See [`Node`] for the host contract.

mod log;
mod message;
mod node;

pub use log::{Entry, Index, Log, Term};
pub use message::{
    AppendEntries, AppendEntriesResponse, Envelope, Message, RequestVote, RequestVoteResponse,
};
pub use node::{Config, Node, NodeId, Status, Timeout, TimeoutKind, Timestamp};

use std::time::Duration;

/// The default base election timeout before a follower or candidate starts a
/// new election.
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(300);

/// The default jitter window applied to election timeouts, to avoid repeated
/// split elections when multiple nodes time out simultaneously.
pub const ELECTION_TIMEOUT_JITTER: Duration = Duration::from_millis(100);

/// The default interval between leader heartbeats to each peer.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);
