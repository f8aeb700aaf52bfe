use super::{
    AppendEntries, AppendEntriesResponse, Envelope, Index, Log, Message, RequestVote,
    RequestVoteResponse, Term, ELECTION_TIMEOUT, ELECTION_TIMEOUT_JITTER, HEARTBEAT_INTERVAL,
};
use crate::error::{bug, Error, Result};

use itertools::Itertools as _;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use serde_derive::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// A node ID. Nodes are numbered 0 up to the cluster size.
pub type NodeId = u16;

/// A reading of the host's monotonic clock, as the elapsed time since a
/// host-chosen epoch. The engine never reads a clock itself; every entry
/// point takes the current time as an argument, and all deadlines it hands
/// back are on the same clock.
pub type Timestamp = Duration;

/// Raft cluster configuration. Must be identical on all nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// The number of servers in the cluster. Node IDs are 0 up to servers.
    /// A majority of servers is needed to elect a leader and commit entries.
    pub servers: u16,
    /// The base election timeout of followers and candidates.
    pub election_timeout: Duration,
    /// The jitter window for election timeouts: actual deadlines are drawn
    /// uniformly from election_timeout ± jitter/2, to avoid repeated split
    /// elections when several nodes time out together.
    pub election_timeout_jitter: Duration,
    /// The interval between leader heartbeats to each peer. Must be
    /// comfortably below the election timeout.
    pub heartbeat_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: 5,
            election_timeout: ELECTION_TIMEOUT,
            election_timeout_jitter: ELECTION_TIMEOUT_JITTER,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

impl Config {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.servers == 0 {
            return Err(Error::invalid_input("cluster must have at least one server"));
        }
        if self.election_timeout.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(Error::invalid_input("timeouts must be non-zero"));
        }
        let min_election = self.election_timeout.saturating_sub(self.election_timeout_jitter / 2);
        if min_election <= self.heartbeat_interval {
            return Err(Error::invalid_input(
                "election timeout must exceed the heartbeat interval",
            ));
        }
        Ok(())
    }
}

/// A pending timer event, for the host to schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeout {
    /// Which handler to invoke once the deadline passes.
    pub kind: TimeoutKind,
    /// The deadline, on the host's monotonic clock.
    pub at: Timestamp,
}

/// The kind of a timer event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutKind {
    /// A follower or candidate election deadline: fire on_election_timeout.
    Election,
    /// A leader heartbeat deadline: fire on_heartbeat_timeout.
    Heartbeat,
}

/// A point-in-time snapshot of a node's state, for observability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The node ID.
    pub id: NodeId,
    /// The node's current term.
    pub term: Term,
    /// The leader of the current term, as far as this node knows.
    pub leader: Option<NodeId>,
    /// The index of the node's last log entry.
    pub last_index: Index,
    /// The term of the node's last log entry.
    pub last_term: Term,
    /// The node's commit index.
    pub commit_index: Index,
    /// The match index of every peer. Only populated on leaders.
    pub match_index: HashMap<NodeId, Index>,
}

/// A Raft node, with a dynamic role. The host drives it synchronously by
/// stepping inbound messages via step() and firing timer events via
/// on_election_timeout() and on_heartbeat_timeout(). These consume the
/// current node and return a new one with a possibly different role, along
/// with a batch of outbound messages for the host to transmit. The engine
/// performs no IO of its own.
///
/// Host contract:
///
/// * Calls for a given node must be serialized (single-writer).
/// * Before transmitting the outbound messages of a call, the host must
///   durably persist the node's term, vote, and log (see [`Node::term`],
///   [`Node::voted_for`], [`Node::log`]).
/// * The host schedules the event returned by next_timeout() and invokes the
///   matching handler once its deadline passes. Lost messages need no other
///   handling; deadlines absorb them by retransmitting or re-electing.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower at term 0
    /// with an empty log. The seed drives election timeout jitter; hosts
    /// should use a distinct seed per node, and tests a fixed one.
    pub fn new(id: NodeId, config: Config, seed: u64, now: Timestamp) -> Result<Self> {
        config.validate()?;
        if id >= config.servers {
            return Err(Error::invalid_input(format!(
                "node ID {id} outside cluster of {} servers",
                config.servers
            )));
        }
        let mut node = RawNode {
            id,
            config,
            term: 0,
            log: Log::new(),
            commit_index: 0,
            rng: StdRng::seed_from_u64(seed),
            outbox: Vec::new(),
            role: Follower::new(None, None, Timestamp::default()),
        };
        node.role.election_deadline = node.gen_election_deadline(now);
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeId {
        match self {
            Node::Candidate(node) => node.id,
            Node::Follower(node) => node.id,
            Node::Leader(node) => node.id,
        }
    }

    /// Returns the node's current term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(node) => node.term,
            Node::Follower(node) => node.term,
            Node::Leader(node) => node.term,
        }
    }

    /// Returns the node we voted for in the current term, if any. Candidates
    /// and leaders hold their own vote. The host must persist this together
    /// with the term and log before transmitting any messages.
    pub fn voted_for(&self) -> Option<NodeId> {
        match self {
            Node::Candidate(node) => Some(node.id),
            Node::Follower(node) => node.role.voted_for,
            Node::Leader(node) => Some(node.id),
        }
    }

    /// Returns the node's log.
    pub fn log(&self) -> &Log {
        match self {
            Node::Candidate(node) => &node.log,
            Node::Follower(node) => &node.log,
            Node::Leader(node) => &node.log,
        }
    }

    /// Returns the node's commit index.
    pub fn commit_index(&self) -> Index {
        match self {
            Node::Candidate(node) => node.commit_index,
            Node::Follower(node) => node.commit_index,
            Node::Leader(node) => node.commit_index,
        }
    }

    /// Processes an inbound message.
    pub fn step(self, envelope: Envelope, now: Timestamp) -> (Self, Vec<Envelope>) {
        debug!("Stepping {envelope:?}");
        let mut node = match self {
            Node::Candidate(node) => node.step(envelope, now),
            Node::Follower(node) => node.step(envelope, now),
            Node::Leader(node) => node.step(envelope, now),
        };
        let outbox = node.take_outbox();
        (node, outbox)
    }

    /// Processes an election timeout event. If the election deadline has
    /// passed (inclusively), followers and candidates campaign for
    /// leadership in a new term. Leaders have no election deadline and
    /// ignore the event.
    pub fn on_election_timeout(self, now: Timestamp) -> (Self, Vec<Envelope>) {
        let mut node = match self {
            Node::Candidate(node) if now >= node.role.election_deadline => {
                let mut node = node;
                node.campaign(now);
                node.check_election(now)
            }
            Node::Follower(node) if now >= node.role.election_deadline => {
                node.into_candidate(now)
            }
            node => node,
        };
        let outbox = node.take_outbox();
        (node, outbox)
    }

    /// Processes a heartbeat timeout event. The leader sends an append
    /// (possibly empty) to every peer whose heartbeat deadline has passed.
    /// Other roles ignore the event.
    pub fn on_heartbeat_timeout(self, now: Timestamp) -> (Self, Vec<Envelope>) {
        let mut node = match self {
            Node::Leader(mut node) => {
                node.heartbeat(now);
                node.into()
            }
            node => node,
        };
        let outbox = node.take_outbox();
        (node, outbox)
    }

    /// Proposes a command for replication, returning its log index. Only the
    /// leader accepts proposals; other roles fail with Error::NotLeader and
    /// the host should resubmit to the leader. No messages are emitted: the
    /// entry ships to each peer at its next heartbeat deadline.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<Index> {
        match self {
            Node::Leader(node) => Ok(node.propose(command)),
            Node::Candidate(_) | Node::Follower(_) => Err(Error::NotLeader),
        }
    }

    /// Returns the next timer event the host should schedule: the election
    /// deadline for followers and candidates, or the earliest peer heartbeat
    /// deadline for leaders. None only for a peerless leader, which has
    /// nothing to wait for.
    pub fn next_timeout(&self) -> Option<Timeout> {
        match self {
            Node::Candidate(node) => {
                Some(Timeout { kind: TimeoutKind::Election, at: node.role.election_deadline })
            }
            Node::Follower(node) => {
                Some(Timeout { kind: TimeoutKind::Election, at: node.role.election_deadline })
            }
            Node::Leader(node) => node
                .role
                .progress
                .values()
                .map(|progress| progress.heartbeat_deadline)
                .min()
                .map(|at| Timeout { kind: TimeoutKind::Heartbeat, at }),
        }
    }

    /// Returns a status snapshot of the node.
    pub fn status(&self) -> Status {
        let (last_index, last_term) = self.log().get_last_index();
        let (leader, match_index) = match self {
            Node::Candidate(_) => (None, HashMap::new()),
            Node::Follower(node) => (node.role.leader, HashMap::new()),
            Node::Leader(node) => {
                let match_index = node
                    .role
                    .progress
                    .iter()
                    .map(|(peer, progress)| (*peer, progress.match_index))
                    .collect();
                (Some(node.id), match_index)
            }
        };
        Status {
            id: self.id(),
            term: self.term(),
            leader,
            last_index,
            last_term,
            commit_index: self.commit_index(),
            match_index,
        }
    }

    /// Drains the messages queued during the current call.
    fn take_outbox(&mut self) -> Vec<Envelope> {
        match self {
            Node::Candidate(node) => std::mem::take(&mut node.outbox),
            Node::Follower(node) => std::mem::take(&mut node.outbox),
            Node::Leader(node) => std::mem::take(&mut node.outbox),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(node: RawNode<Candidate>) -> Self {
        Node::Candidate(node)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(node: RawNode<Follower>) -> Self {
        Node::Follower(node)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(node: RawNode<Leader>) -> Self {
        Node::Leader(node)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>. See:
/// <http://cliffle.com/blog/rust-typestate/>
pub struct RawNode<R: Role = Follower> {
    /// The node ID.
    id: NodeId,
    /// The cluster configuration.
    config: Config,
    /// The current term. Never regresses.
    term: Term,
    /// The replicated log.
    log: Log,
    /// The highest log index known to be committed. Never regresses.
    commit_index: Index,
    /// RNG for election timeout jitter, seeded by the host so that tests
    /// are deterministic.
    rng: StdRng,
    /// Messages queued for transmission during the current call. Drained by
    /// every public entry point; empty between calls.
    outbox: Vec<Envelope>,
    /// Role-specific state.
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            config: self.config,
            term: self.term,
            log: self.log,
            commit_index: self.commit_index,
            rng: self.rng,
            outbox: self.outbox,
            role,
        }
    }

    /// Returns the node's peers, in ascending ID order.
    fn peers(&self) -> Vec<NodeId> {
        (0..self.config.servers).filter(|id| *id != self.id).collect()
    }

    /// Returns the cluster size as number of nodes.
    fn cluster_size(&self) -> usize {
        self.config.servers as usize
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Queues a message for transmission to the given node.
    fn send(&mut self, to: NodeId, message: Message) {
        let envelope = Envelope { from: self.id, to, message };
        debug!("Sending {envelope:?}");
        self.outbox.push(envelope);
    }

    /// Queues a message for transmission to all peers.
    fn broadcast(&mut self, message: Message) {
        for to in self.peers() {
            self.send(to, message.clone());
        }
    }

    /// Generates a randomized election deadline.
    fn gen_election_deadline(&mut self, now: Timestamp) -> Timestamp {
        let jitter = self.config.election_timeout_jitter;
        let base = now + self.config.election_timeout.saturating_sub(jitter / 2);
        base + self.rng.gen_range(Duration::ZERO..=jitter)
    }

    /// Checks that an inbound envelope is addressed to us by a known peer.
    /// Misrouted traffic is a host bug, and is dropped.
    fn valid_envelope(&self, envelope: &Envelope) -> bool {
        let valid = envelope.to == self.id
            && envelope.from != self.id
            && envelope.from < self.config.servers;
        if !valid {
            bug!("misrouted message {envelope:?} on node {}", self.id);
        }
        valid
    }

    /// Rejects or drops a message from a past term. Requests are answered
    /// with a rejection carrying our term, so the sender can step down.
    /// Stale responses are simply dropped.
    fn reject_stale(&mut self, envelope: Envelope) {
        debug_assert!(envelope.message.term() < self.term, "message term not stale");
        let term = self.term;
        match envelope.message {
            Message::RequestVote(_) => self.send(
                envelope.from,
                Message::RequestVoteResponse(RequestVoteResponse { term, granted: false }),
            ),
            Message::AppendEntries(_) => self.send(
                envelope.from,
                Message::AppendEntriesResponse(AppendEntriesResponse::TermFailure { term }),
            ),
            Message::RequestVoteResponse(_) | Message::AppendEntriesResponse(_) => {
                debug!("Dropping stale message {envelope:?}")
            }
        }
    }
}

/// A candidate is campaigning to become leader.
pub struct Candidate {
    /// Votes received, including our own.
    votes: HashSet<NodeId>,
    /// When to start a new election if this one doesn't complete.
    election_deadline: Timestamp,
}

impl Candidate {
    /// Creates a new candidate role, with a vote for ourself.
    fn new(id: NodeId, election_deadline: Timestamp) -> Self {
        Self { votes: HashSet::from([id]), election_deadline }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Campaigns for leadership: increments the term, votes for ourself, and
    /// solicits votes from all peers.
    fn campaign(&mut self, now: Timestamp) {
        self.term += 1;
        info!("Starting election for term {}", self.term);
        let election_deadline = self.gen_election_deadline(now);
        self.role = Candidate::new(self.id, election_deadline);
        let (last_index, last_term) = self.log.get_last_index();
        self.broadcast(Message::RequestVote(RequestVote {
            term: self.term,
            candidate: self.id,
            last_index,
            last_term,
        }));
    }

    /// Assumes leadership if the votes received are a majority. A
    /// single-node cluster wins on its own vote.
    fn check_election(self, now: Timestamp) -> Node {
        if self.role.votes.len() >= self.quorum_size() {
            return self.into_leader(now).into();
        }
        self.into()
    }

    /// Transitions the candidate to a follower. Either we lost the election
    /// to a leader in our term (keeping our self-vote, so we can't vote for
    /// anyone else), or we discovered a new term and step into it with a
    /// clean slate.
    fn into_follower(
        mut self,
        leader: Option<NodeId>,
        term: Term,
        now: Timestamp,
    ) -> RawNode<Follower> {
        debug_assert!(term >= self.term, "term regression {} → {term}", self.term);
        let election_deadline = self.gen_election_deadline(now);
        if let Some(leader) = leader {
            debug_assert_eq!(term, self.term, "can't follow leader in a different term");
            info!("Lost election, following leader {leader} in term {term}");
            let voted_for = Some(self.id);
            self.into_role(Follower::new(Some(leader), voted_for, election_deadline))
        } else {
            debug_assert!(term > self.term, "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            self.into_role(Follower::new(None, None, election_deadline))
        }
    }

    /// Transitions the candidate to a leader. We won the election. Each peer
    /// starts at next_index right after our log, with nothing known to
    /// match. The initial appends are sent immediately to assert leadership;
    /// the heartbeat deadlines schedule the next periodic round.
    fn into_leader(self, now: Timestamp) -> RawNode<Leader> {
        info!("Won election for term {}, becoming leader", self.term);
        let peers = self.peers();
        let (last_index, _) = self.log.get_last_index();
        let heartbeat_deadline = now + self.config.heartbeat_interval;
        let mut node = self.into_role(Leader::new(peers, last_index, heartbeat_deadline));
        for peer in node.peers() {
            node.maybe_send_append(peer, now);
        }
        node
    }

    /// Processes a message.
    fn step(mut self, envelope: Envelope, now: Timestamp) -> Node {
        if !self.valid_envelope(&envelope) {
            return self.into();
        }
        let term = envelope.message.term();
        if term < self.term {
            self.reject_stale(envelope);
            return self.into();
        }
        // If we discover a future term, step into it as a leaderless
        // follower and reprocess the message there.
        if term > self.term {
            return self.into_follower(None, term, now).step(envelope, now);
        }

        let from = envelope.from;
        match envelope.message {
            // Don't grant votes to other candidates campaigning in our term.
            Message::RequestVote(_) => {
                let term = self.term;
                self.send(
                    from,
                    Message::RequestVoteResponse(RequestVoteResponse { term, granted: false }),
                );
            }

            // Tally a granted vote, and assume leadership on a majority. The
            // vote set makes duplicate responses harmless.
            Message::RequestVoteResponse(RequestVoteResponse { granted: true, .. }) => {
                self.role.votes.insert(from);
                return self.check_election(now);
            }

            // We didn't get this vote. :(
            Message::RequestVoteResponse(_) => {}

            // A leader won this term's election. Follow it and reprocess the
            // message as a follower.
            Message::AppendEntries(_) => {
                let term = self.term;
                return self.into_follower(Some(from), term, now).step(envelope, now);
            }

            // We're not a leader in this term, so we don't expect these.
            Message::AppendEntriesResponse(_) => {
                debug!("Dropping append response on candidate {}", self.id)
            }
        }
        self.into()
    }
}

/// A follower replicates state from a leader, and votes in elections.
pub struct Follower {
    /// The leader of the current term, or None if unknown.
    leader: Option<NodeId>,
    /// The node we voted for in the current term, if any.
    voted_for: Option<NodeId>,
    /// When to campaign if nothing is heard from a leader or candidate.
    election_deadline: Timestamp,
}

impl Follower {
    /// Creates a new follower role.
    fn new(
        leader: Option<NodeId>,
        voted_for: Option<NodeId>,
        election_deadline: Timestamp,
    ) -> Self {
        Self { leader, voted_for, election_deadline }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Transitions the follower to a candidate, campaigning for leadership
    /// in a new term.
    fn into_candidate(self, now: Timestamp) -> Node {
        let id = self.id;
        let mut node = self.into_role(Candidate::new(id, now));
        node.campaign(now);
        node.check_election(now)
    }

    /// Transitions the follower into a follower: either we found the leader
    /// of the current term (keeping any vote we cast in it), or we
    /// discovered a new term and don't know the leader yet.
    fn into_follower(mut self, leader: Option<NodeId>, term: Term, now: Timestamp) -> Self {
        debug_assert!(term >= self.term, "term regression {} → {term}", self.term);
        if let Some(leader) = leader {
            debug_assert_eq!(term, self.term, "can't follow leader in a different term");
            debug_assert!(self.role.leader.is_none(), "already have a leader in this term");
            info!("Following leader {leader} in term {term}");
            self.role.leader = Some(leader);
            self.role.election_deadline = self.gen_election_deadline(now);
        } else {
            debug_assert!(term > self.term, "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            let election_deadline = self.gen_election_deadline(now);
            self.role = Follower::new(None, None, election_deadline);
        }
        self
    }

    /// Processes a message.
    fn step(mut self, envelope: Envelope, now: Timestamp) -> Node {
        if !self.valid_envelope(&envelope) {
            return self.into();
        }
        let term = envelope.message.term();
        if term < self.term {
            self.reject_stale(envelope);
            return self.into();
        }
        // If we discover a future term, step into it as a leaderless
        // follower and reprocess the message there.
        if term > self.term {
            return self.into_follower(None, term, now).step(envelope, now);
        }

        let from = envelope.from;
        match envelope.message {
            // A candidate in our term is asking for our vote. Grant it if we
            // haven't voted for anyone else and its log is at least as
            // up-to-date as ours, which guarantees the winner's log contains
            // every committed entry.
            Message::RequestVote(request) => {
                if request.candidate != from {
                    bug!("vote solicitation from {from} on behalf of {}", request.candidate);
                    return self.into();
                }
                let (last_index, last_term) = self.log.get_last_index();
                let can_vote =
                    self.role.voted_for.is_none() || self.role.voted_for == Some(from);
                let up_to_date = request.last_term > last_term
                    || (request.last_term == last_term && request.last_index >= last_index);
                let granted = can_vote && up_to_date;
                if granted {
                    info!("Voting for {from} in term {} election", self.term);
                    self.role.voted_for = Some(from);
                    self.role.election_deadline = self.gen_election_deadline(now);
                }
                let term = self.term;
                self.send(
                    from,
                    Message::RequestVoteResponse(RequestVoteResponse { term, granted }),
                );
            }

            // We may receive votes after losing an election and stepping
            // down. Ignore them.
            Message::RequestVoteResponse(_) => {}

            // The leader is replicating entries (or heartbeating). Make sure
            // it is our leader, following it if we don't have one yet, and
            // push our election deadline out.
            Message::AppendEntries(request) => {
                let leader = self.role.leader;
                match leader {
                    Some(leader) if leader != from => {
                        bug!("multiple leaders {leader} and {from} in term {}", self.term);
                        return self.into();
                    }
                    Some(_) => self.role.election_deadline = self.gen_election_deadline(now),
                    None => {
                        let term = self.term;
                        self = self.into_follower(Some(from), term, now);
                    }
                }
                self.append(from, request);
            }

            // We're not a leader in this term, so we don't expect these.
            Message::AppendEntriesResponse(_) => {
                debug!("Dropping append response on follower {}", self.id)
            }
        }
        self.into()
    }

    /// Processes an AppendEntries request from our leader.
    fn append(&mut self, from: NodeId, request: AppendEntries) {
        debug_assert_eq!(request.term, self.term, "append term mismatch");
        debug_assert_eq!(request.leader, from, "append leader mismatch");
        if let Some(first) = request.entries.first() {
            debug_assert_eq!(first.index, request.prev_index + 1, "append base mismatch");
        }

        // If the base entry isn't in our log, reject the request and report
        // our actual last entry, letting the leader pick a new replication
        // point. Base index 0 matches unconditionally.
        if request.prev_index > 0 && !self.log.has(request.prev_index, request.prev_term) {
            debug!("Rejecting append at missing base {}@{}", request.prev_index, request.prev_term);
            let (last_index, last_term) = self.log.get_last_index();
            let term = self.term;
            self.send(
                from,
                Message::AppendEntriesResponse(AppendEntriesResponse::LogFailure {
                    term,
                    last_index,
                    last_term,
                }),
            );
            return;
        }

        // Splice the entries into our log, truncating any conflicting tail.
        // Our log now matches the leader's through the base plus the given
        // entries; anything we hold beyond that is unconfirmed and is not
        // reported as matching.
        let match_index = request.prev_index + request.entries.len() as u64;
        debug_assert!(request.commit_index <= match_index, "commit index beyond sent entries");
        self.log.splice(request.entries);

        // Advance our commit index up to the leader's, but never past our
        // own log.
        if request.commit_index > self.commit_index {
            let (last_index, _) = self.log.get_last_index();
            self.commit_index = std::cmp::min(request.commit_index, last_index);
            debug!("Advanced commit index to {}", self.commit_index);
        }

        let term = self.term;
        self.send(
            from,
            Message::AppendEntriesResponse(AppendEntriesResponse::Success {
                term,
                last_index: match_index,
            }),
        );
    }
}

/// Replication progress of a single peer, tracked by the leader.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Progress {
    /// The next log index to send to the peer. Always above match_index.
    next_index: Index,
    /// The highest log index known to be replicated on the peer. Never
    /// regresses for the lifetime of a leadership term.
    match_index: Index,
    /// Whether an append is in flight to the peer. At most one request is
    /// outstanding per peer at a time; the response clears it, and a due
    /// heartbeat deadline times it out and retransmits.
    in_flight: bool,
    /// When to next send an append (possibly empty) to the peer.
    heartbeat_deadline: Timestamp,
}

impl Progress {
    /// Attempts to advance the peer's match index, returning true if it
    /// did. next_index is bumped along if needed, but is otherwise left as
    /// is to avoid regressing it unnecessarily.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }

    /// Lowers next_index to the given index if it's currently above it.
    /// Can't regress below match_index + 1. Returns true if it changed.
    fn regress_next(&mut self, next_index: Index) -> bool {
        if next_index >= self.next_index || self.next_index <= self.match_index + 1 {
            return false;
        }
        self.next_index = std::cmp::max(next_index, self.match_index + 1);
        true
    }
}

/// A leader replicates its log to followers and commits entries.
pub struct Leader {
    /// Replication progress of each peer.
    progress: HashMap<NodeId, Progress>,
}

impl Leader {
    /// Creates a new leader role from the winning candidate's log.
    fn new(peers: Vec<NodeId>, last_index: Index, heartbeat_deadline: Timestamp) -> Self {
        let progress = peers
            .into_iter()
            .map(|peer| {
                let progress = Progress {
                    next_index: last_index + 1,
                    match_index: 0,
                    in_flight: false,
                    heartbeat_deadline,
                };
                (peer, progress)
            })
            .collect();
        Self { progress }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Transitions the leader to a follower after discovering a newer term.
    fn into_follower(mut self, term: Term, now: Timestamp) -> RawNode<Follower> {
        debug_assert!(term > self.term, "can only step down to a later term");
        info!("Discovered new term {term}, stepping down");
        self.term = term;
        let election_deadline = self.gen_election_deadline(now);
        self.into_role(Follower::new(None, None, election_deadline))
    }

    /// Processes a message.
    fn step(mut self, envelope: Envelope, now: Timestamp) -> Node {
        if !self.valid_envelope(&envelope) {
            return self.into();
        }
        let term = envelope.message.term();
        if term < self.term {
            self.reject_stale(envelope);
            return self.into();
        }
        // If we discover a future term, step down and reprocess the message
        // as a follower.
        if term > self.term {
            return self.into_follower(term, now).step(envelope, now);
        }

        let from = envelope.from;
        match envelope.message {
            // Don't grant votes in a term where we already lead.
            Message::RequestVote(_) => {
                let term = self.term;
                self.send(
                    from,
                    Message::RequestVoteResponse(RequestVoteResponse { term, granted: false }),
                );
            }

            // Votes may arrive after we won the election. Ignore them.
            Message::RequestVoteResponse(_) => {}

            // There can't be two leaders in the same term.
            Message::AppendEntries(_) => {
                bug!("saw other leader {from} in term {}", self.term);
            }

            // A follower appended our entries. Record its progress and try
            // to commit.
            Message::AppendEntriesResponse(AppendEntriesResponse::Success {
                last_index, ..
            }) => {
                let (leader_last, _) = self.log.get_last_index();
                if last_index > leader_last {
                    bug!("follower {from} acknowledged unknown index {last_index}");
                    return self.into();
                }
                match self.role.progress.get_mut(&from) {
                    Some(progress) => {
                        progress.in_flight = false;
                        if progress.advance(last_index) {
                            self.maybe_commit(last_index);
                        }
                    }
                    None => debug!("Dropping response from untracked peer {from}"),
                }
            }

            // The follower's log doesn't contain the base entry we sent.
            // Find a new replication point from its reported last entry.
            Message::AppendEntriesResponse(AppendEntriesResponse::LogFailure {
                last_index,
                last_term,
                ..
            }) => {
                self.backoff(from, last_index, last_term);
            }

            // A leftover reply to a request from an earlier leadership term
            // of ours. Ignore it.
            Message::AppendEntriesResponse(AppendEntriesResponse::TermFailure { .. }) => {}
        }
        self.into()
    }

    /// Sends an append to every peer whose heartbeat deadline has passed. A
    /// due deadline also times out a request still in flight to that peer:
    /// the request or its response was presumably lost, so retransmit.
    fn heartbeat(&mut self, now: Timestamp) {
        let due: Vec<NodeId> = self
            .role
            .progress
            .iter()
            .filter(|(_, progress)| progress.heartbeat_deadline <= now)
            .map(|(peer, _)| *peer)
            .sorted()
            .collect();
        for peer in due {
            if let Some(progress) = self.role.progress.get_mut(&peer) {
                progress.in_flight = false;
            }
            self.maybe_send_append(peer, now);
        }
    }

    /// Appends a command to our log under the current term, returning its
    /// index. Replication happens at each peer's next heartbeat deadline. A
    /// single-node cluster commits immediately, being its own majority.
    fn propose(&mut self, command: Vec<u8>) -> Index {
        let index = self.log.append(self.term, command);
        debug!("Appended entry {index} in term {}", self.term);
        self.maybe_commit(index);
        index
    }

    /// Builds and sends an AppendEntries to a peer, unless one is already in
    /// flight. Sends everything from the peer's next_index onwards; an empty
    /// entries vector doubles as a heartbeat. Schedules the peer's next
    /// heartbeat.
    fn maybe_send_append(&mut self, peer: NodeId, now: Timestamp) {
        let (last_index, _) = self.log.get_last_index();
        let Some(progress) = self.role.progress.get(&peer) else {
            bug!("unknown peer {peer}");
            return;
        };
        if progress.in_flight {
            return;
        }
        debug_assert!(progress.next_index > progress.match_index, "next_index at or below match");
        debug_assert!(progress.next_index <= last_index + 1, "next_index beyond log");

        let prev_index = progress.next_index - 1;
        let prev_term = match self.log.get(prev_index) {
            Some(entry) => entry.term,
            None if prev_index == 0 => 0,
            None => {
                bug!("missing base entry {prev_index} for peer {peer}");
                return;
            }
        };
        let entries = self.log.scan_from(prev_index).to_vec();

        if let Some(progress) = self.role.progress.get_mut(&peer) {
            progress.in_flight = true;
            progress.heartbeat_deadline = now + self.config.heartbeat_interval;
        }

        debug!("Replicating {} entries at base {prev_index} to {peer}", entries.len());
        let message = Message::AppendEntries(AppendEntries {
            term: self.term,
            leader: self.id,
            prev_index,
            prev_term,
            entries,
            commit_index: self.commit_index,
        });
        self.send(peer, message);
    }

    /// Commits the given index if it is replicated on a majority and belongs
    /// to our own term. Entries from previous terms are never counted
    /// directly: they commit transitively when a later entry of our term
    /// does (see figure 8 in the Raft paper).
    fn maybe_commit(&mut self, index: Index) {
        if index == 0 || index <= self.commit_index {
            return;
        }
        let replicated =
            1 + self.role.progress.values().filter(|p| p.match_index >= index).count();
        if replicated < self.quorum_size() {
            return;
        }
        match self.log.get(index) {
            Some(entry) if entry.term == self.term => {
                debug!("Committing entry {index} in term {}", self.term);
                self.commit_index = index;
            }
            Some(_) => {}
            None => bug!("commit index {index} not in log"),
        }
    }

    /// Finds a new replication point for a peer that rejected an append,
    /// from its reported last log entry.
    fn backoff(&mut self, peer: NodeId, follower_last: Index, follower_term: Term) {
        let match_index = match self.role.progress.get_mut(&peer) {
            Some(progress) => {
                progress.in_flight = false;
                progress.match_index
            }
            None => {
                debug!("Dropping response from untracked peer {peer}");
                return;
            }
        };
        // The peer is known to match beyond its claimed last entry, so the
        // rejection must be a reordered stale reply.
        if follower_last < match_index {
            debug!("Ignoring stale append rejection from {peer}");
            return;
        }

        let found = self.log.has(follower_last, follower_term);
        let next_index = if found {
            // The follower's last entry is in our log, so by log matching
            // its entire log is a prefix of ours. Resume right after it.
            follower_last + 1
        } else {
            // The follower's tail disagrees with our log. Skip its whole
            // conflicting term: walk back past every entry at or above the
            // reported term, and resume after the last entry below it. The
            // reported index can exceed our log when the follower carries a
            // longer stale tail, so clamp the walk to our last entry.
            let (last_index, _) = self.log.get_last_index();
            let mut index = std::cmp::min(follower_last, last_index);
            while index > 0 && self.log.get(index).map_or(false, |e| e.term >= follower_term) {
                index -= 1;
            }
            index + 1
        };

        if let Some(progress) = self.role.progress.get_mut(&peer) {
            if found {
                progress.advance(follower_last);
            }
            progress.regress_next(next_index);
            debug!("Backing off peer {peer} to next index {}", progress.next_index);
        }
    }
}
