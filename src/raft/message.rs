use super::{Entry, Index, NodeId, Term};

use serde_derive::{Deserialize, Serialize};

/// A message between two Raft nodes. The engine returns envelopes for the
/// host to transmit, and the host wraps inbound messages in envelopes before
/// stepping them. The serialization format is the host's choice; all wire
/// types derive serde traits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeId,
    /// The recipient.
    pub to: NodeId,
    /// The message payload.
    pub message: Message,
}

/// A message payload. Each message carries the sender's term at the time it
/// was built; a receiver in a lower term steps up to it, and a receiver in a
/// higher term rejects or ignores the message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Candidates solicit votes from all peers when campaigning.
    RequestVote(RequestVote),
    /// A voter's reply to a RequestVote.
    RequestVoteResponse(RequestVoteResponse),
    /// Leaders replicate log entries to a peer, and assert their leadership.
    /// An empty entries vector serves as a heartbeat.
    AppendEntries(AppendEntries),
    /// A follower's reply to an AppendEntries.
    AppendEntriesResponse(AppendEntriesResponse),
}

impl Message {
    /// Returns the term carried by the message.
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteResponse(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesResponse(m) => m.term(),
        }
    }
}

/// A vote solicitation from a candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    /// The candidate's term.
    pub term: Term,
    /// The candidate soliciting the vote.
    pub candidate: NodeId,
    /// The index of the candidate's last log entry.
    pub last_index: Index,
    /// The term of the candidate's last log entry.
    pub last_term: Term,
}

/// A reply to a vote solicitation. A voter grants at most one vote per term,
/// and only to candidates whose log is at least as up-to-date as its own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// The voter's current term.
    pub term: Term,
    /// Whether the vote was granted.
    pub granted: bool,
}

/// A log replication request from a leader. The entries extend the leader's
/// log immediately after the (prev_index, prev_term) base entry, which the
/// follower must contain for the append to apply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    /// The leader's term.
    pub term: Term,
    /// The leader sending the request.
    pub leader: NodeId,
    /// The index of the log entry immediately preceding the entries, or 0
    /// when replicating from the start of the log.
    pub prev_index: Index,
    /// The term of the entry at prev_index, or 0 when prev_index is 0.
    pub prev_term: Term,
    /// Entries to replicate, oldest first. Empty for heartbeats.
    pub entries: Vec<Entry>,
    /// The leader's commit index, allowing followers to advance theirs.
    pub commit_index: Index,
}

/// A reply to an AppendEntries request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendEntriesResponse {
    /// The follower's log matched the request base and now extends through
    /// last_index (the base plus the appended entries).
    Success {
        /// The follower's current term.
        term: Term,
        /// The last log index known to match the leader.
        last_index: Index,
    },
    /// The follower's log did not contain the base entry. It reports its
    /// actual last entry so the leader can pick a new replication point.
    LogFailure {
        /// The follower's current term.
        term: Term,
        /// The index of the follower's last log entry.
        last_index: Index,
        /// The term of the follower's last log entry.
        last_term: Term,
    },
    /// The request's term was behind the follower's. The leader should step
    /// down when it sees the newer term.
    TermFailure {
        /// The follower's current term.
        term: Term,
    },
}

impl AppendEntriesResponse {
    /// Returns the responder's term.
    pub fn term(&self) -> Term {
        match self {
            Self::Success { term, .. } => *term,
            Self::LogFailure { term, .. } => *term,
            Self::TermFailure { term } => *term,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// The wire schema is versioned by the host's serializer; this pins the
    /// field and variant names so renames don't slip through unnoticed.
    #[test]
    fn wire_schema() {
        let envelope = Envelope {
            from: 1,
            to: 2,
            message: Message::AppendEntries(AppendEntries {
                term: 3,
                leader: 1,
                prev_index: 4,
                prev_term: 2,
                entries: vec![Entry { index: 5, term: 3, command: vec![0xff] }],
                commit_index: 4,
            }),
        };
        assert_eq!(
            serde_json::to_value(&envelope).expect("serialize failed"),
            json!({
                "from": 1,
                "to": 2,
                "message": {
                    "AppendEntries": {
                        "term": 3,
                        "leader": 1,
                        "prev_index": 4,
                        "prev_term": 2,
                        "entries": [{"index": 5, "term": 3, "command": [255]}],
                        "commit_index": 4,
                    }
                }
            })
        );

        let response = Message::AppendEntriesResponse(AppendEntriesResponse::LogFailure {
            term: 3,
            last_index: 4,
            last_term: 2,
        });
        assert_eq!(
            serde_json::to_value(&response).expect("serialize failed"),
            json!({
                "AppendEntriesResponse": {
                    "LogFailure": {"term": 3, "last_index": 4, "last_term": 2}
                }
            })
        );
    }

    #[test]
    fn message_term() {
        let vote = Message::RequestVote(RequestVote { term: 7, candidate: 0, last_index: 0, last_term: 0 });
        assert_eq!(vote.term(), 7);
        let stale = Message::AppendEntriesResponse(AppendEntriesResponse::TermFailure { term: 9 });
        assert_eq!(stale.term(), 9);
    }
}
