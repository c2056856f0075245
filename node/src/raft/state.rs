// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The raft role machine.
//!
//! Handlers take the current time in milliseconds and the local log, and
//! return the answer plus a list of [`RaftAction`]s. The caller performs the
//! actions in order; `PersistMeta` always comes before any message that
//! depends on it.

use std::collections::{BTreeMap, BTreeSet};

use brook_logstream::frame::FrameIter;
use brook_logstream::{FrameBatch, LogStream};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::messages::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use super::meta::PersistedMeta;
use super::{NodeId, RaftError, RaftResult, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftAction {
    PersistMeta(PersistedMeta),
    SendVote { to: NodeId, request: VoteRequest },
    SendAppend { to: NodeId, request: AppendRequest },
    BecameLeader { term: Term },
    BecameFollower { term: Term, leader: Option<NodeId> },
    CommitAdvanced(i64),
    /// Pull the entries after `from` up to `target` from `leader`.
    StartReplication { leader: NodeId, from: i64, target: i64 },
}

/// The log operations raft needs.
pub trait RaftLog {
    fn last_position(&self) -> i64;
    fn last_term(&self) -> Term;
    fn term_at(&self, position: i64) -> RaftResult<Option<Term>>;
    fn commit_position(&self) -> i64;
    fn set_commit_position(&mut self, position: i64) -> bool;
    /// Makes everything appended so far durable.
    fn flush(&self) -> RaftResult<()>;
    fn truncate_after(&mut self, position: i64) -> RaftResult<()>;
    /// Appends replicated frames as they are and flushes them.
    fn append_frames(&mut self, frames: &[u8]) -> RaftResult<i64>;
    fn read_frames(&self, from_position: i64, max_bytes: usize) -> RaftResult<Option<FrameBatch>>;
}

impl RaftLog for LogStream {
    fn last_position(&self) -> i64 {
        LogStream::last_position(self)
    }

    fn last_term(&self) -> Term {
        LogStream::last_term(self)
    }

    fn term_at(&self, position: i64) -> RaftResult<Option<Term>> {
        Ok(LogStream::term_at(self, position)?)
    }

    fn commit_position(&self) -> i64 {
        LogStream::commit_position(self)
    }

    fn set_commit_position(&mut self, position: i64) -> bool {
        LogStream::set_commit_position(self, position)
    }

    fn flush(&self) -> RaftResult<()> {
        Ok(LogStream::flush(self)?)
    }

    fn truncate_after(&mut self, position: i64) -> RaftResult<()> {
        Ok(LogStream::truncate_after(self, position)?)
    }

    fn append_frames(&mut self, frames: &[u8]) -> RaftResult<i64> {
        let appended = self.append_block(frames)?;
        self.flush()?;
        Ok(appended.last_position)
    }

    fn read_frames(&self, from_position: i64, max_bytes: usize) -> RaftResult<Option<FrameBatch>> {
        Ok(LogStream::read_frames(self, from_position, max_bytes, false)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftTimeouts {
    pub election_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

pub struct RaftState {
    id: NodeId,
    peers: Vec<NodeId>,
    role: Role,
    term: Term,
    voted_for: Option<NodeId>,
    /// Term and vote as last stored.
    durable: PersistedMeta,
    leader: Option<NodeId>,
    votes: BTreeSet<NodeId>,
    next_position: BTreeMap<NodeId, i64>,
    match_position: BTreeMap<NodeId, i64>,
    /// Leader only: the local log is durable up to here.
    flushed_position: i64,
    timeouts: RaftTimeouts,
    election_deadline: u64,
    heartbeat_due: u64,
    max_append_bytes: usize,
    replicating: bool,
}

impl RaftState {
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        meta: PersistedMeta,
        timeouts: RaftTimeouts,
        max_append_bytes: usize,
        now: u64,
    ) -> Self {
        let mut state = Self {
            id,
            peers,
            role: Role::Follower,
            term: meta.term,
            voted_for: meta.voted_for,
            durable: meta,
            leader: None,
            votes: BTreeSet::new(),
            next_position: BTreeMap::new(),
            match_position: BTreeMap::new(),
            flushed_position: 0,
            timeouts,
            election_deadline: 0,
            heartbeat_due: 0,
            max_append_bytes,
            replicating: false,
        };
        state.reset_election_deadline(now);
        state
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn is_replicating(&self) -> bool {
        self.replicating
    }

    pub fn match_position(&self, peer: NodeId) -> Option<i64> {
        self.match_position.get(&peer).copied()
    }

    /// Lowest position every follower holds; the leader may compact below it.
    pub fn lowest_match_position(&self, log: &impl RaftLog) -> i64 {
        self.peers
            .iter()
            .map(|p| self.match_position.get(p).copied().unwrap_or(0))
            .min()
            .unwrap_or_else(|| log.last_position())
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn meta(&self) -> PersistedMeta {
        PersistedMeta {
            term: self.term,
            voted_for: self.voted_for,
        }
    }

    fn reset_election_deadline(&mut self, now: u64) {
        let base = self.timeouts.election_timeout_ms.max(1);
        self.election_deadline = now + rand::thread_rng().gen_range(base..2 * base);
    }

    /// Advances timers: elections for followers and candidates, heartbeats
    /// for the leader.
    pub fn tick(&mut self, now: u64, log: &impl RaftLog) -> RaftResult<Vec<RaftAction>> {
        match self.role {
            Role::Leader if now >= self.heartbeat_due => {
                self.heartbeat_due = now + self.timeouts.heartbeat_interval_ms;
                self.append_to_all(log)
            }
            Role::Leader => Ok(Vec::new()),
            Role::Follower | Role::Candidate if now >= self.election_deadline => self.start_election(now, log),
            Role::Follower | Role::Candidate => Ok(Vec::new()),
        }
    }

    fn start_election(&mut self, now: u64, log: &impl RaftLog) -> RaftResult<Vec<RaftAction>> {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id);
        self.leader = None;
        self.votes = BTreeSet::from([self.id]);
        self.reset_election_deadline(now);
        info!("Node {} starts an election for term {}", self.id, self.term);

        let mut actions = vec![RaftAction::PersistMeta(self.meta())];
        if self.votes.len() >= self.quorum() {
            actions.extend(self.become_leader(now, log)?);
            return Ok(actions);
        }

        let request = VoteRequest {
            term: self.term,
            candidate: self.id,
            last_log_position: log.last_position(),
            last_log_term: log.last_term(),
        };
        actions.extend(self.peers.iter().map(|&to| RaftAction::SendVote {
            to,
            request: request.clone(),
        }));
        Ok(actions)
    }

    fn become_leader(&mut self, now: u64, log: &impl RaftLog) -> RaftResult<Vec<RaftAction>> {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.replicating = false;
        let next = log.last_position() + 1;
        self.next_position = self.peers.iter().map(|&p| (p, next)).collect();
        self.match_position = self.peers.iter().map(|&p| (p, 0)).collect();
        self.heartbeat_due = now + self.timeouts.heartbeat_interval_ms;
        log.flush()?;
        self.flushed_position = log.last_position();
        info!("Node {} is leader for term {}", self.id, self.term);

        let mut actions = vec![RaftAction::BecameLeader { term: self.term }];
        actions.extend(self.append_to_all(log)?);
        Ok(actions)
    }

    /// Adopts `term` (if newer) and follows `leader`.
    fn become_follower(&mut self, term: Term, leader: Option<NodeId>, now: u64) -> Vec<RaftAction> {
        let mut actions = Vec::new();
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            actions.push(RaftAction::PersistMeta(self.meta()));
        }
        let changed = self.role != Role::Follower || self.leader != leader;
        if self.role == Role::Leader {
            info!("Node {} steps down in term {}", self.id, self.term);
        }
        self.role = Role::Follower;
        self.leader = leader;
        self.votes.clear();
        self.reset_election_deadline(now);
        if changed {
            actions.push(RaftAction::BecameFollower { term: self.term, leader });
        }
        actions
    }

    /// Gives up leadership, or candidacy, without a newer term.
    pub fn step_down(&mut self, now: u64) -> Vec<RaftAction> {
        let term = self.term;
        self.become_follower(term, None, now)
    }

    /// `meta` reached disk.
    pub fn meta_stored(&mut self, meta: PersistedMeta) {
        self.durable = meta;
    }

    /// Storing the meta failed. Term and vote fall back to what is on disk so
    /// nothing unpersisted is ever acted on, and the node waits as a
    /// follower.
    pub fn meta_store_failed(&mut self, now: u64) -> Vec<RaftAction> {
        warn!(
            "Node {} falls back to term {} (vote {:?}) after a failed meta write",
            self.id, self.durable.term, self.durable.voted_for
        );
        let was = (self.role, self.leader);
        self.term = self.durable.term;
        self.voted_for = self.durable.voted_for;
        self.role = Role::Follower;
        self.leader = None;
        self.votes.clear();
        self.reset_election_deadline(now);
        if was != (Role::Follower, None) {
            return vec![RaftAction::BecameFollower {
                term: self.term,
                leader: None,
            }];
        }
        Vec::new()
    }

    pub fn handle_vote_request(
        &mut self,
        request: &VoteRequest,
        log: &impl RaftLog,
        now: u64,
    ) -> (VoteResponse, Vec<RaftAction>) {
        let mut actions = Vec::new();
        if request.term > self.term {
            actions.extend(self.become_follower(request.term, None, now));
        }

        let up_to_date = (request.last_log_term, request.last_log_position) >= (log.last_term(), log.last_position());
        let free = self.voted_for.map_or(true, |v| v == request.candidate);
        let granted = request.term == self.term && free && up_to_date;

        if granted {
            if self.voted_for != Some(request.candidate) {
                self.voted_for = Some(request.candidate);
                actions.push(RaftAction::PersistMeta(self.meta()));
            }
            self.reset_election_deadline(now);
        }
        debug!(
            "Node {} {} vote for {} in term {}",
            self.id,
            if granted { "grants" } else { "denies" },
            request.candidate,
            request.term
        );

        (
            VoteResponse {
                term: self.term,
                granted,
            },
            actions,
        )
    }

    pub fn handle_vote_response(
        &mut self,
        from: NodeId,
        response: &VoteResponse,
        log: &impl RaftLog,
        now: u64,
    ) -> RaftResult<Vec<RaftAction>> {
        if response.term > self.term {
            return Ok(self.become_follower(response.term, None, now));
        }
        if self.role != Role::Candidate || response.term != self.term || !response.granted {
            return Ok(Vec::new());
        }

        self.votes.insert(from);
        if self.votes.len() >= self.quorum() {
            return self.become_leader(now, log);
        }
        Ok(Vec::new())
    }

    pub fn handle_append_request(
        &mut self,
        request: &AppendRequest,
        log: &mut impl RaftLog,
        now: u64,
    ) -> RaftResult<(AppendResponse, Vec<RaftAction>)> {
        if request.term < self.term {
            warn!(
                "Node {} rejects append from {} with stale term {} (current {})",
                self.id, request.leader, request.term, self.term
            );
            return Ok((self.rejection(log.last_position()), Vec::new()));
        }

        let mut actions = Vec::new();
        if request.term > self.term || self.role != Role::Follower || self.leader != Some(request.leader) {
            actions.extend(self.become_follower(request.term, Some(request.leader), now));
        } else {
            self.reset_election_deadline(now);
        }

        if self.replicating {
            return Ok((self.rejection(log.last_position()), actions));
        }

        if request.previous_position > log.last_position() {
            // Entries after the commit position may differ from the leader's,
            // so the pull starts there; the appender keeps whatever matches
            // and only replaces a tail that conflicts.
            self.replicating = true;
            let last = log.last_position();
            let from = log.commit_position();
            info!(
                "Node {} is behind leader {} ({} < {}), pulling entries after {}",
                self.id, request.leader, last, request.previous_position, from
            );
            actions.push(RaftAction::StartReplication {
                leader: request.leader,
                from,
                target: request.previous_position,
            });
            return Ok((self.rejection(last), actions));
        }

        if log.term_at(request.previous_position)? != Some(request.previous_term) {
            debug!(
                "Node {} has no entry at {} with term {}",
                self.id, request.previous_position, request.previous_term
            );
            return Ok((self.rejection(log.last_position()), actions));
        }

        let matched = append_entries(log, request.previous_position, &request.entries)?;
        let commit = request.commit_position.min(matched);
        if log.set_commit_position(commit) {
            actions.push(RaftAction::CommitAdvanced(log.commit_position()));
        }

        Ok((
            AppendResponse {
                term: self.term,
                succeeded: true,
                previous_position: matched,
                node: self.id,
            },
            actions,
        ))
    }

    fn rejection(&self, last_position: i64) -> AppendResponse {
        AppendResponse {
            term: self.term,
            succeeded: false,
            previous_position: last_position,
            node: self.id,
        }
    }

    pub fn handle_append_response(
        &mut self,
        response: &AppendResponse,
        log: &mut impl RaftLog,
        now: u64,
    ) -> RaftResult<Vec<RaftAction>> {
        if response.term > self.term {
            return Ok(self.become_follower(response.term, None, now));
        }
        if self.role != Role::Leader || response.term != self.term {
            return Ok(Vec::new());
        }
        let peer = response.node;
        let Some(next) = self.next_position.get(&peer).copied() else {
            return Ok(Vec::new());
        };
        let matched = self.match_position.get(&peer).copied().unwrap_or(0);

        let mut actions = Vec::new();
        if response.succeeded {
            let matched = matched.max(response.previous_position);
            self.match_position.insert(peer, matched);
            self.next_position.insert(peer, matched + 1);
            actions.extend(self.advance_commit(log)?);
            if matched < log.last_position() {
                actions.push(self.append_to(peer, log)?);
            }
        } else {
            let lowered = (next - 1).min(response.previous_position + 1).max(matched + 1);
            self.next_position.insert(peer, lowered);
            // A follower that keeps rejecting at the same spot is pulling
            // entries on its own; it hears from us again on the next heartbeat.
            if lowered != next {
                actions.push(self.append_to(peer, log)?);
            }
        }
        Ok(actions)
    }

    /// Called by the leader after it appended to its own log. Flushes the
    /// log before the new entries count toward the quorum.
    pub fn on_local_append(&mut self, log: &mut impl RaftLog) -> RaftResult<Vec<RaftAction>> {
        if self.role != Role::Leader {
            return Ok(Vec::new());
        }
        log.flush()?;
        self.flushed_position = log.last_position();
        let mut actions = self.advance_commit(log)?;
        actions.extend(self.append_to_all(log)?);
        Ok(actions)
    }

    /// Called when a pull started by `StartReplication` ended.
    pub fn replication_finished(&mut self) {
        self.replicating = false;
    }

    fn advance_commit(&mut self, log: &mut impl RaftLog) -> RaftResult<Vec<RaftAction>> {
        let mut positions: Vec<i64> = self.peers.iter().map(|p| self.match_position.get(p).copied().unwrap_or(0)).collect();
        positions.push(self.flushed_position);
        positions.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = positions[self.quorum() - 1];
        if candidate <= log.commit_position() || log.term_at(candidate)? != Some(self.term) {
            return Ok(Vec::new());
        }
        if log.set_commit_position(candidate) {
            return Ok(vec![RaftAction::CommitAdvanced(log.commit_position())]);
        }
        Ok(Vec::new())
    }

    fn append_to_all(&self, log: &impl RaftLog) -> RaftResult<Vec<RaftAction>> {
        self.peers.iter().map(|&peer| self.append_to(peer, log)).collect()
    }

    fn append_to(&self, peer: NodeId, log: &impl RaftLog) -> RaftResult<RaftAction> {
        let next = self.next_position.get(&peer).copied().unwrap_or(log.last_position() + 1);
        let previous_position = next - 1;
        let previous_term = match log.term_at(previous_position)? {
            Some(term) => term,
            None => {
                warn!("Entry {} for follower {} is no longer in the log", previous_position, peer);
                0
            }
        };
        let entries = log
            .read_frames(next, self.max_append_bytes)?
            .map(|batch| batch.bytes)
            .unwrap_or_default();

        Ok(RaftAction::SendAppend {
            to: peer,
            request: AppendRequest {
                term: self.term,
                leader: self.id,
                previous_position,
                previous_term,
                commit_position: log.commit_position(),
                entries,
            },
        })
    }
}

/// Appends the frames after `previous_position`, skipping those already
/// present with the same term and truncating the tail at the first
/// conflict. Returns the last position that now matches the leader.
pub(crate) fn append_entries(log: &mut impl RaftLog, previous_position: i64, frames: &[u8]) -> RaftResult<i64> {
    let mut matched = previous_position;
    let mut offset = 0;

    for entry in FrameIter::new(frames) {
        let entry = entry?;
        if entry.position != matched + 1 {
            return Err(RaftError::Encoding(format!(
                "append carries position {} after {}",
                entry.position, matched
            )));
        }
        if entry.position > log.last_position() {
            break;
        }
        if log.term_at(entry.position)? == Some(entry.raft_term) {
            matched = entry.position;
            offset += entry.aligned_length();
            continue;
        }
        if entry.position <= log.commit_position() {
            return Err(RaftError::CommittedConflict {
                position: entry.position,
            });
        }
        warn!("Truncating conflicting entries from position {}", entry.position);
        log.truncate_after(entry.position - 1)?;
        break;
    }

    if offset < frames.len() {
        matched = log.append_frames(&frames[offset..])?;
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use brook_logstream::{Address, LogAppendEntry, LogStorage, LogStreamError, MemoryLogStorage, ReadResult};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    const TIMEOUTS: RaftTimeouts = RaftTimeouts {
        election_timeout_ms: 100,
        heartbeat_interval_ms: 20,
    };

    fn log() -> LogStream {
        LogStream::open(Arc::new(MemoryLogStorage::new()), 1).unwrap()
    }

    fn append(log: &mut LogStream, count: usize, term: Term) {
        let entries: Vec<_> = (0..count).map(|i| LogAppendEntry::new(i as i64, vec![1], vec![2])).collect();
        log.append(&entries, -1, 1, term).unwrap();
    }

    /// Memory storage that counts flushes and can refuse them.
    #[derive(Default)]
    struct CountingStorage {
        inner: MemoryLogStorage,
        flushes: AtomicUsize,
        fail_flush: AtomicBool,
    }

    impl LogStorage for CountingStorage {
        fn is_byte_addressable(&self) -> bool {
            self.inner.is_byte_addressable()
        }

        fn append(&self, block: &[u8]) -> brook_logstream::Result<Address> {
            self.inner.append(block)
        }

        fn read(&self, buf: &mut [u8], address: Address) -> brook_logstream::Result<ReadResult> {
            self.inner.read(buf, address)
        }

        fn first_block_address(&self) -> Option<Address> {
            self.inner.first_block_address()
        }

        fn flush(&self) -> brook_logstream::Result<()> {
            if self.fail_flush.load(Ordering::SeqCst) {
                return Err(LogStreamError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "device gone",
                )));
            }
            self.flushes.fetch_add(1, Ordering::SeqCst);
            self.inner.flush()
        }

        fn truncate(&self, address: Address) -> brook_logstream::Result<()> {
            self.inner.truncate(address)
        }

        fn compact(&self, address: Address) -> brook_logstream::Result<Option<Address>> {
            self.inner.compact(address)
        }
    }

    fn raft(id: NodeId, peers: Vec<NodeId>) -> RaftState {
        RaftState::new(id, peers, PersistedMeta::default(), TIMEOUTS, 1024 * 1024, 0)
    }

    fn leader_of_three(log: &mut LogStream) -> RaftState {
        let mut node = raft(1, vec![2, 3]);
        node.tick(1_000, &*log).unwrap();
        let term = node.term();
        node.handle_vote_response(2, &VoteResponse { term, granted: true }, &*log, 1_000)
            .unwrap();
        assert!(node.is_leader());
        node
    }

    #[test]
    fn test_single_node_elects_itself() {
        let log = log();
        let mut node = raft(1, vec![]);
        assert!(node.tick(10, &log).unwrap().is_empty());

        let actions = node.tick(1_000, &log).unwrap();
        assert!(node.is_leader());
        assert_eq!(node.term(), 1);
        assert_eq!(
            actions[0],
            RaftAction::PersistMeta(PersistedMeta { term: 1, voted_for: Some(1) })
        );
        assert!(actions.contains(&RaftAction::BecameLeader { term: 1 }));
    }

    #[test]
    fn test_candidate_needs_a_quorum() {
        let log = log();
        let mut node = raft(1, vec![2, 3]);
        let actions = node.tick(1_000, &log).unwrap();
        assert_eq!(node.role(), Role::Candidate);
        let votes = actions.iter().filter(|a| matches!(a, RaftAction::SendVote { .. })).count();
        assert_eq!(votes, 2);

        node.handle_vote_response(2, &VoteResponse { term: 1, granted: false }, &log, 1_000)
            .unwrap();
        assert_eq!(node.role(), Role::Candidate);

        let actions = node
            .handle_vote_response(3, &VoteResponse { term: 1, granted: true }, &log, 1_000)
            .unwrap();
        assert!(node.is_leader());
        let appends = actions.iter().filter(|a| matches!(a, RaftAction::SendAppend { .. })).count();
        assert_eq!(appends, 2);
    }

    #[test]
    fn test_vote_rules() {
        let mut log = log();
        append(&mut log, 3, 2);
        let mut node = raft(2, vec![1, 3]);

        // Candidate log is shorter in the same term.
        let behind = VoteRequest {
            term: 3,
            candidate: 1,
            last_log_position: 2,
            last_log_term: 2,
        };
        let (response, actions) = node.handle_vote_request(&behind, &log, 0);
        assert!(!response.granted);
        assert_eq!(node.term(), 3);
        assert!(actions.contains(&RaftAction::PersistMeta(PersistedMeta { term: 3, voted_for: None })));

        let current = VoteRequest {
            term: 3,
            candidate: 3,
            last_log_position: 3,
            last_log_term: 2,
        };
        let (response, _) = node.handle_vote_request(&current, &log, 0);
        assert!(response.granted);
        assert_eq!(node.voted_for(), Some(3));

        // One vote per term.
        let other = VoteRequest { candidate: 1, last_log_position: 10, ..current.clone() };
        let (response, _) = node.handle_vote_request(&other, &log, 0);
        assert!(!response.granted);

        // Asking again is fine.
        let (response, actions) = node.handle_vote_request(&current, &log, 0);
        assert!(response.granted);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_leader_steps_down_on_higher_term() {
        let mut log = log();
        let mut node = leader_of_three(&mut log);

        let response = AppendResponse {
            term: node.term() + 1,
            succeeded: false,
            previous_position: 0,
            node: 2,
        };
        let actions = node.handle_append_response(&response, &mut log, 1_000).unwrap();
        assert_eq!(node.role(), Role::Follower);
        assert!(actions
            .iter()
            .any(|a| matches!(a, RaftAction::BecameFollower { leader: None, .. })));
    }

    #[test]
    fn test_commit_needs_quorum_in_current_term() {
        let mut log = log();
        append(&mut log, 2, 0);
        let mut node = leader_of_three(&mut log);
        let term = node.term();

        // Entries from an older term are not committed by counting replicas.
        let ack = |previous_position| AppendResponse {
            term,
            succeeded: true,
            previous_position,
            node: 2,
        };
        node.handle_append_response(&ack(2), &mut log, 1_000).unwrap();
        assert_eq!(log.commit_position(), 0);

        append(&mut log, 1, term);
        node.on_local_append(&mut log).unwrap();
        assert_eq!(log.commit_position(), 0);

        let actions = node.handle_append_response(&ack(3), &mut log, 1_000).unwrap();
        assert_eq!(log.commit_position(), 3);
        assert!(actions.contains(&RaftAction::CommitAdvanced(3)));
        assert_eq!(node.match_position(2), Some(3));
        assert_eq!(node.lowest_match_position(&log), 0);
    }

    #[test]
    fn test_follower_appends_and_commits() {
        let mut leader_log = log();
        append(&mut leader_log, 3, 1);
        let entries = leader_log.read_frames(1, 1024, false).unwrap().unwrap().bytes;

        let mut log = log();
        let mut node = raft(2, vec![1, 3]);
        let request = AppendRequest {
            term: 1,
            leader: 1,
            previous_position: 0,
            previous_term: 0,
            commit_position: 2,
            entries,
        };
        let (response, actions) = node.handle_append_request(&request, &mut log, 0).unwrap();
        assert!(response.succeeded);
        assert_eq!(response.previous_position, 3);
        assert_eq!(log.last_position(), 3);
        assert_eq!(log.commit_position(), 2);
        assert_eq!(node.leader(), Some(1));
        assert!(actions.contains(&RaftAction::CommitAdvanced(2)));

        // Redelivery changes nothing.
        let (response, _) = node.handle_append_request(&request, &mut log, 0).unwrap();
        assert!(response.succeeded);
        assert_eq!(log.last_position(), 3);
    }

    #[test]
    fn test_stale_leader_is_rejected() {
        let mut log = log();
        let mut node = RaftState::new(2, vec![1], PersistedMeta { term: 5, voted_for: None }, TIMEOUTS, 1024, 0);
        let request = AppendRequest {
            term: 4,
            leader: 1,
            previous_position: 0,
            previous_term: 0,
            commit_position: 0,
            entries: Vec::new(),
        };
        let (response, actions) = node.handle_append_request(&request, &mut log, 0).unwrap();
        assert!(!response.succeeded);
        assert_eq!(response.term, 5);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_lagging_follower_pulls_entries() {
        let mut log = log();
        append(&mut log, 3, 1);
        log.set_commit_position(1);
        let mut node = raft(2, vec![1]);

        let request = AppendRequest {
            term: 2,
            leader: 1,
            previous_position: 10,
            previous_term: 2,
            commit_position: 10,
            entries: Vec::new(),
        };
        let (response, actions) = node.handle_append_request(&request, &mut log, 0).unwrap();
        assert!(!response.succeeded);
        assert_eq!(response.previous_position, 3);
        // Acknowledged entries after the commit position are kept.
        assert_eq!(log.last_position(), 3);
        assert_eq!(log.term_at(3).unwrap(), Some(1));
        assert!(node.is_replicating());
        assert!(actions.contains(&RaftAction::StartReplication {
            leader: 1,
            from: 1,
            target: 10
        }));

        // Appends are refused until the pull is over.
        let (response, _) = node.handle_append_request(&request, &mut log, 0).unwrap();
        assert!(!response.succeeded);
        node.replication_finished();
        assert!(!node.is_replicating());
    }

    #[test]
    fn test_leader_flushes_before_counting_its_own_entries() {
        let storage = Arc::new(CountingStorage::default());
        let mut log = LogStream::open(storage.clone(), 1).unwrap();
        let mut node = raft(1, vec![]);
        node.tick(1_000, &log).unwrap();
        assert!(node.is_leader());
        let flushes = storage.flushes.load(Ordering::SeqCst);

        append(&mut log, 1, node.term());
        let actions = node.on_local_append(&mut log).unwrap();
        assert!(storage.flushes.load(Ordering::SeqCst) > flushes);
        assert_eq!(log.commit_position(), 1);
        assert!(actions.contains(&RaftAction::CommitAdvanced(1)));

        // An entry that could not be flushed is not committed.
        storage.fail_flush.store(true, Ordering::SeqCst);
        append(&mut log, 1, node.term());
        assert!(node.on_local_append(&mut log).is_err());
        assert_eq!(log.commit_position(), 1);

        storage.fail_flush.store(false, Ordering::SeqCst);
        node.on_local_append(&mut log).unwrap();
        assert_eq!(log.commit_position(), 2);
    }

    #[test]
    fn test_unflushed_leader_entries_do_not_count() {
        let mut log = log();
        let mut node = leader_of_three(&mut log);
        let term = node.term();
        append(&mut log, 1, term);

        let ack = AppendResponse {
            term,
            succeeded: true,
            previous_position: 1,
            node: 2,
        };
        node.handle_append_response(&ack, &mut log, 1_000).unwrap();
        assert_eq!(log.commit_position(), 0);

        node.on_local_append(&mut log).unwrap();
        assert_eq!(log.commit_position(), 1);
    }

    #[test]
    fn test_failed_meta_write_forgets_the_vote() {
        let log = log();
        let mut node = raft(2, vec![1, 3]);
        let request = VoteRequest {
            term: 4,
            candidate: 1,
            last_log_position: 0,
            last_log_term: 0,
        };
        let (response, actions) = node.handle_vote_request(&request, &log, 0);
        assert!(response.granted);
        assert!(actions.contains(&RaftAction::PersistMeta(PersistedMeta { term: 4, voted_for: Some(1) })));

        node.meta_store_failed(0);
        assert_eq!(node.term(), 0);
        assert_eq!(node.voted_for(), None);

        // Asked again, the vote is persisted again rather than assumed.
        let (response, actions) = node.handle_vote_request(&request, &log, 0);
        assert!(response.granted);
        assert!(actions.iter().any(|a| matches!(a, RaftAction::PersistMeta(_))));

        node.meta_stored(PersistedMeta { term: 4, voted_for: Some(1) });
        let (response, actions) = node.handle_vote_request(&request, &log, 0);
        assert!(response.granted);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_failed_meta_write_demotes_a_candidate() {
        let log = log();
        let mut node = raft(1, vec![2, 3]);
        node.tick(1_000, &log).unwrap();
        assert_eq!(node.role(), Role::Candidate);

        let actions = node.meta_store_failed(1_000);
        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.term(), 0);
        assert_eq!(
            actions,
            vec![RaftAction::BecameFollower { term: 0, leader: None }]
        );
    }

    #[test]
    fn test_leader_steps_down_in_its_own_term() {
        let mut log = log();
        let mut node = leader_of_three(&mut log);
        let term = node.term();

        let actions = node.step_down(1_000);
        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.term(), term);
        assert_eq!(actions, vec![RaftAction::BecameFollower { term, leader: None }]);
    }

    #[test]
    fn test_conflicting_tail_is_replaced() {
        let mut log = log();
        append(&mut log, 1, 1);
        append(&mut log, 2, 2);

        let mut leader_log = self::log();
        append(&mut leader_log, 1, 1);
        append(&mut leader_log, 3, 3);
        let entries = leader_log.read_frames(2, 4096, false).unwrap().unwrap().bytes;

        let mut node = raft(2, vec![1]);
        let request = AppendRequest {
            term: 3,
            leader: 1,
            previous_position: 1,
            previous_term: 1,
            commit_position: 1,
            entries,
        };
        let (response, _) = node.handle_append_request(&request, &mut log, 0).unwrap();
        assert!(response.succeeded);
        assert_eq!(response.previous_position, 4);
        assert_eq!(log.last_position(), 4);
        assert_eq!(log.term_at(2).unwrap(), Some(3));
        assert_eq!(log.last_term(), 3);
    }

    #[test]
    fn test_conflict_below_commit_is_an_error() {
        let mut log = log();
        append(&mut log, 2, 1);
        log.set_commit_position(2);

        let mut leader_log = self::log();
        append(&mut leader_log, 2, 2);
        let entries = leader_log.read_frames(1, 4096, false).unwrap().unwrap().bytes;

        let mut node = raft(2, vec![1]);
        let request = AppendRequest {
            term: 2,
            leader: 1,
            previous_position: 0,
            previous_term: 0,
            commit_position: 2,
            entries,
        };
        let err = node.handle_append_request(&request, &mut log, 0).unwrap_err();
        assert!(matches!(err, RaftError::CommittedConflict { position: 1 }));
    }
}
