// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Pull-based catch-up for a follower that lags behind the leader.
//!
//! [`LogReplicator`] is the state machine; the partition actor drives it with
//! messages, [`replicate`] drives it over a [`ReplicationClient`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use brook_logstream::frame::FrameIter;
use brook_logstream::{LogStream, LogStreamError};
use thiserror::Error;
use tracing::{debug, info};

use super::messages::{ReplicateRequest, ReplicateResponse};
use super::state::append_entries;
use super::{RaftError, RaftResult};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("Invalid log replication response: {0}")]
    InvalidLogReplicationResponse(String),
    #[error("Failed to append replicated entries: {0}")]
    FailedAppend(String),
    #[error("Replicate request {request_id} timed out")]
    Timeout { request_id: u64 },
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Where replicated frames end up.
pub trait LogAppender {
    /// Appends the frames and returns the last position that now matches
    /// the leader.
    fn append_replicated(&mut self, frames: &[u8]) -> RaftResult<i64>;
}

/// Frames already present with the same term are kept; a conflicting tail
/// after the commit position is replaced.
impl LogAppender for LogStream {
    fn append_replicated(&mut self, frames: &[u8]) -> RaftResult<i64> {
        let Some(first) = FrameIter::new(frames).next() else {
            return Ok(self.last_position());
        };
        append_entries(self, first?.position - 1, frames)
    }
}

/// Sends replicate requests; answers come back through `recv` and are
/// matched to requests by id.
#[async_trait]
pub trait ReplicationClient: Send {
    async fn send(&mut self, request: ReplicateRequest) -> Result<(), ReplicationError>;
    async fn recv(&mut self) -> Option<ReplicateResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Requesting { from: i64 },
    Awaiting { request_id: u64, from: i64 },
    Appending { request_id: u64 },
    Done(i64),
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationStep {
    /// Send this request next.
    Request(ReplicateRequest),
    Done(i64),
    /// The response answered an older request.
    Ignored,
}

pub struct LogReplicator {
    target: i64,
    state: ReplicatorState,
    next_request_id: u64,
    timeout: Duration,
    sent_at: Option<Instant>,
}

impl LogReplicator {
    /// Replicates the entries after `from` until `target` is reached or the
    /// leader has nothing more.
    pub fn new(from: i64, target: i64, timeout: Duration) -> Self {
        Self {
            target,
            state: ReplicatorState::Requesting { from },
            next_request_id: 1,
            timeout,
            sent_at: None,
        }
    }

    pub fn state(&self) -> ReplicatorState {
        self.state
    }

    pub fn target(&self) -> i64 {
        self.target
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ReplicatorState::Done(_) | ReplicatorState::Failed)
    }

    /// The first request. Only valid in the initial state.
    pub fn start(&mut self, now: Instant) -> Option<ReplicateRequest> {
        match self.state {
            ReplicatorState::Requesting { from } => Some(self.request(from, now)),
            _ => None,
        }
    }

    fn request(&mut self, from: i64, now: Instant) -> ReplicateRequest {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.state = ReplicatorState::Awaiting { request_id, from };
        self.sent_at = Some(now);
        debug!("Requesting entries after {} (request {})", from, request_id);
        ReplicateRequest {
            request_id,
            from_position: from,
        }
    }

    fn fail(&mut self, error: ReplicationError) -> Result<ReplicationStep, ReplicationError> {
        self.state = ReplicatorState::Failed;
        self.sent_at = None;
        Err(error)
    }

    /// Fails the outstanding request once it waited longer than the timeout.
    pub fn check_timeout(&mut self, now: Instant) -> Result<(), ReplicationError> {
        if let (ReplicatorState::Awaiting { request_id, .. }, Some(sent_at)) = (self.state, self.sent_at) {
            if now.duration_since(sent_at) >= self.timeout {
                self.fail(ReplicationError::Timeout { request_id })?;
            }
        }
        Ok(())
    }

    pub fn on_response(
        &mut self,
        response: ReplicateResponse,
        appender: &mut impl LogAppender,
        now: Instant,
    ) -> Result<ReplicationStep, ReplicationError> {
        let from = match self.state {
            ReplicatorState::Awaiting { request_id, from } if request_id == response.request_id => from,
            _ => return Ok(ReplicationStep::Ignored),
        };

        if response.to_position < 0 {
            return self.fail(ReplicationError::InvalidLogReplicationResponse(format!(
                "negative to_position {}",
                response.to_position
            )));
        }

        if !response.serialized_events.is_empty() {
            if let Err(reason) = check_frames(&response.serialized_events, from, response.to_position) {
                return self.fail(ReplicationError::InvalidLogReplicationResponse(reason));
            }

            self.state = ReplicatorState::Appending {
                request_id: response.request_id,
            };
            match appender.append_replicated(&response.serialized_events) {
                Ok(position) if position < 0 => {
                    return self.fail(ReplicationError::FailedAppend(format!(
                        "appender returned position {position}"
                    )))
                }
                Ok(_) => {}
                Err(e) => return self.fail(ReplicationError::FailedAppend(e.to_string())),
            }
        }

        let reached = response.to_position;
        if response.more_available && reached < self.target && !response.serialized_events.is_empty() {
            return Ok(ReplicationStep::Request(self.request(reached, now)));
        }

        self.state = ReplicatorState::Done(reached);
        self.sent_at = None;
        info!("Replicated up to position {} (target {})", reached, self.target);
        Ok(ReplicationStep::Done(reached))
    }
}

/// The frames must follow `from` without gaps and end at `to_position`.
fn check_frames(frames: &[u8], from: i64, to_position: i64) -> Result<(), String> {
    let mut expected = from + 1;
    for entry in FrameIter::new(frames) {
        let entry = entry.map_err(|e| e.to_string())?;
        if entry.position != expected {
            return Err(format!("expected position {expected}, found {}", entry.position));
        }
        expected += 1;
    }
    let last = expected - 1;
    if last != to_position {
        return Err(format!("last entry is {last} but to_position is {to_position}"));
    }
    Ok(())
}

/// Pulls the entries after `from` through `client` until `target` is reached.
pub async fn replicate<C, A>(
    client: &mut C,
    appender: &mut A,
    from: i64,
    target: i64,
    timeout: Duration,
) -> Result<i64, ReplicationError>
where
    C: ReplicationClient + ?Sized,
    A: LogAppender,
{
    let mut replicator = LogReplicator::new(from, target, timeout);
    let mut request = replicator.start(Instant::now());

    loop {
        if let Some(next) = request.take() {
            client.send(next).await?;
        }

        let response = match tokio::time::timeout(timeout, client.recv()).await {
            Ok(Some(response)) => response,
            Ok(None) => return Err(ReplicationError::Transport("replication channel closed".into())),
            Err(_) => {
                replicator.check_timeout(Instant::now() + timeout)?;
                continue;
            }
        };

        match replicator.on_response(response, appender, Instant::now())? {
            ReplicationStep::Request(next) => request = Some(next),
            ReplicationStep::Done(position) => return Ok(position),
            ReplicationStep::Ignored => {}
        }
    }
}

/// Leader side: the frames after `request.from_position`, at most
/// `max_bytes` of them.
pub fn serve_replicate(log: &LogStream, request: &ReplicateRequest, max_bytes: usize) -> RaftResult<ReplicateResponse> {
    let from = request.from_position;
    if from + 1 < log.first_position() {
        return Err(RaftError::Log(LogStreamError::Validation(format!(
            "entries after {from} were compacted (first position {})",
            log.first_position()
        ))));
    }

    Ok(match log.read_frames(from + 1, max_bytes, false)? {
        Some(batch) => ReplicateResponse {
            request_id: request.request_id,
            to_position: batch.last_position,
            more_available: batch.more_available,
            serialized_events: batch.bytes,
        },
        None => ReplicateResponse {
            request_id: request.request_id,
            to_position: from,
            more_available: false,
            serialized_events: Vec::new(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use brook_logstream::{LogAppendEntry, MemoryLogStorage};
    use std::collections::VecDeque;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn leader_log(count: usize) -> LogStream {
        let mut log = LogStream::open(Arc::new(MemoryLogStorage::new()), 1).unwrap();
        let entries: Vec<_> = (0..count).map(|i| LogAppendEntry::new(i as i64, vec![1], vec![2; 40])).collect();
        log.append(&entries, -1, 1, 1).unwrap();
        log
    }

    fn frames(log: &LogStream, from: i64, to: i64) -> Vec<u8> {
        let mut bytes = Vec::new();
        for position in from..=to {
            bytes.extend_from_slice(log.entry_at(position).unwrap().unwrap().frame_bytes());
        }
        bytes
    }

    /// Answers each request with the next scripted response, stamped with
    /// the request id.
    struct ScriptedClient {
        script: VecDeque<(i64, bool, Vec<u8>)>,
        sent: Vec<ReplicateRequest>,
        pending: VecDeque<ReplicateResponse>,
    }

    impl ScriptedClient {
        fn new(script: Vec<(i64, bool, Vec<u8>)>) -> Self {
            Self {
                script: script.into(),
                sent: Vec::new(),
                pending: VecDeque::new(),
            }
        }
    }

    #[async_trait]
    impl ReplicationClient for ScriptedClient {
        async fn send(&mut self, request: ReplicateRequest) -> Result<(), ReplicationError> {
            let (to_position, more_available, serialized_events) = self
                .script
                .pop_front()
                .ok_or_else(|| ReplicationError::Transport("script exhausted".into()))?;
            self.pending.push_back(ReplicateResponse {
                request_id: request.request_id,
                to_position,
                more_available,
                serialized_events,
            });
            self.sent.push(request);
            Ok(())
        }

        async fn recv(&mut self) -> Option<ReplicateResponse> {
            self.pending.pop_front()
        }
    }

    /// Serves requests from a real leader log.
    struct LeaderClient {
        leader: LogStream,
        max_bytes: usize,
        sent: Vec<ReplicateRequest>,
        pending: VecDeque<ReplicateResponse>,
    }

    #[async_trait]
    impl ReplicationClient for LeaderClient {
        async fn send(&mut self, request: ReplicateRequest) -> Result<(), ReplicationError> {
            let response = serve_replicate(&self.leader, &request, self.max_bytes)
                .map_err(|e| ReplicationError::Transport(e.to_string()))?;
            self.pending.push_back(response);
            self.sent.push(request);
            Ok(())
        }

        async fn recv(&mut self) -> Option<ReplicateResponse> {
            self.pending.pop_front()
        }
    }

    struct FailingAppender;

    impl LogAppender for FailingAppender {
        fn append_replicated(&mut self, _frames: &[u8]) -> RaftResult<i64> {
            Err(RaftError::Log(LogStreamError::Validation("disk full".into())))
        }
    }

    struct NegativeAppender;

    impl LogAppender for NegativeAppender {
        fn append_replicated(&mut self, _frames: &[u8]) -> RaftResult<i64> {
            Ok(-1)
        }
    }

    fn follower() -> LogStream {
        LogStream::open(Arc::new(MemoryLogStorage::new()), 1).unwrap()
    }

    #[tokio::test]
    async fn test_more_available_below_target_requests_again_from_to_position() {
        let leader = leader_log(4);
        let mut client = ScriptedClient::new(vec![(2, true, frames(&leader, 1, 2)), (3, false, frames(&leader, 3, 3))]);
        let mut log = follower();

        let reached = replicate(&mut client, &mut log, 0, 3, TIMEOUT).await.unwrap();
        assert_eq!(reached, 3);
        assert_eq!(client.sent.len(), 2);
        assert_eq!(client.sent[1].from_position, 2);
        assert_eq!(log.last_position(), 3);
    }

    #[tokio::test]
    async fn test_no_more_available_completes_with_to_position() {
        let leader = leader_log(4);
        let mut client = ScriptedClient::new(vec![(2, false, frames(&leader, 1, 2))]);
        let mut log = follower();

        let reached = replicate(&mut client, &mut log, 0, 10, TIMEOUT).await.unwrap();
        assert_eq!(reached, 2);
        assert_eq!(client.sent.len(), 1);
    }

    #[tokio::test]
    async fn test_stops_once_target_is_reached() {
        let leader = leader_log(4);
        let mut client = ScriptedClient::new(vec![(2, true, frames(&leader, 1, 2))]);
        let mut log = follower();

        let reached = replicate(&mut client, &mut log, 0, 2, TIMEOUT).await.unwrap();
        assert_eq!(reached, 2);
        assert_eq!(client.sent.len(), 1);
    }

    #[test]
    fn test_one_follow_up_anchored_at_to_position() {
        let leader = leader_log(4);
        let mut log = follower();
        let now = Instant::now();
        let mut replicator = LogReplicator::new(0, 3, TIMEOUT);
        let first = replicator.start(now).unwrap();

        let response = ReplicateResponse {
            request_id: first.request_id,
            to_position: 2,
            more_available: true,
            serialized_events: frames(&leader, 1, 2),
        };
        let step = replicator.on_response(response, &mut log, now).unwrap();
        let ReplicationStep::Request(next) = step else {
            panic!("expected a follow-up request, got {step:?}");
        };
        assert_eq!(next.from_position, 2);
        assert_ne!(next.request_id, first.request_id);
        assert!(replicator.start(now).is_none());
    }

    #[test]
    fn test_stale_response_is_ignored() {
        let leader = leader_log(2);
        let mut log = follower();
        let now = Instant::now();
        let mut replicator = LogReplicator::new(0, 2, TIMEOUT);
        let request = replicator.start(now).unwrap();

        let stale = ReplicateResponse {
            request_id: request.request_id + 7,
            to_position: 2,
            more_available: false,
            serialized_events: frames(&leader, 1, 2),
        };
        assert_eq!(replicator.on_response(stale, &mut log, now).unwrap(), ReplicationStep::Ignored);
        assert_eq!(log.last_position(), 0);
        assert!(!replicator.is_finished());
    }

    #[tokio::test]
    async fn test_negative_to_position_is_invalid() {
        let mut client = ScriptedClient::new(vec![(-1, false, Vec::new())]);
        let err = replicate(&mut client, &mut follower(), 0, 3, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidLogReplicationResponse(_)));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_invalid() {
        let leader = leader_log(3);
        let mut garbage = frames(&leader, 1, 2);
        garbage.truncate(garbage.len() - 3);
        let mut client = ScriptedClient::new(vec![(2, false, garbage)]);
        let err = replicate(&mut client, &mut follower(), 0, 3, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidLogReplicationResponse(_)));

        // to_position must name the last frame sent
        let mut client = ScriptedClient::new(vec![(3, false, frames(&leader, 1, 2))]);
        let err = replicate(&mut client, &mut follower(), 0, 3, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidLogReplicationResponse(_)));
    }

    #[tokio::test]
    async fn test_append_failures() {
        let leader = leader_log(2);
        let mut client = ScriptedClient::new(vec![(2, false, frames(&leader, 1, 2))]);
        let err = replicate(&mut client, &mut FailingAppender, 0, 2, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ReplicationError::FailedAppend(_)));

        let mut client = ScriptedClient::new(vec![(2, false, frames(&leader, 1, 2))]);
        let err = replicate(&mut client, &mut NegativeAppender, 0, 2, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ReplicationError::FailedAppend(_)));
    }

    #[test]
    fn test_unanswered_request_times_out() {
        let now = Instant::now();
        let mut replicator = LogReplicator::new(0, 5, Duration::from_millis(100));
        let request = replicator.start(now).unwrap();

        replicator.check_timeout(now + Duration::from_millis(50)).unwrap();
        let err = replicator.check_timeout(now + Duration::from_millis(100)).unwrap_err();
        assert_eq!(err, ReplicationError::Timeout { request_id: request.request_id });
        assert_eq!(replicator.state(), ReplicatorState::Failed);
    }

    #[tokio::test]
    async fn test_catch_up_from_a_leader_log() {
        let leader = leader_log(20);
        let mut client = LeaderClient {
            leader,
            max_bytes: 200,
            sent: Vec::new(),
            pending: VecDeque::new(),
        };
        let mut log = follower();

        let reached = replicate(&mut client, &mut log, 0, 20, TIMEOUT).await.unwrap();
        assert_eq!(reached, 20);
        assert!(client.sent.len() > 1);
        for position in 1..=20 {
            assert_eq!(
                log.entry_at(position).unwrap().unwrap().frame_bytes(),
                client.leader.entry_at(position).unwrap().unwrap().frame_bytes()
            );
        }
    }

    fn log_with_terms(terms: &[i32]) -> LogStream {
        let mut log = follower();
        for (i, term) in terms.iter().enumerate() {
            let entry = LogAppendEntry::new(i as i64, vec![1], vec![2; 40]);
            log.append(&[entry], -1, 1, *term).unwrap();
        }
        log
    }

    #[tokio::test]
    async fn test_pull_from_commit_keeps_a_matching_tail() {
        let leader = log_with_terms(&[1, 1, 1, 1, 1]);
        let mut log = log_with_terms(&[1, 1, 1]);
        log.set_commit_position(1);

        let mut client = LeaderClient {
            leader,
            max_bytes: 4096,
            sent: Vec::new(),
            pending: VecDeque::new(),
        };
        let reached = replicate(&mut client, &mut log, 1, 5, TIMEOUT).await.unwrap();
        assert_eq!(reached, 5);
        assert_eq!(log.last_position(), 5);
        for position in 1..=5 {
            assert_eq!(
                log.entry_at(position).unwrap().unwrap().frame_bytes(),
                client.leader.entry_at(position).unwrap().unwrap().frame_bytes()
            );
        }
    }

    #[tokio::test]
    async fn test_pull_from_commit_replaces_a_conflicting_tail() {
        let leader = log_with_terms(&[1, 2, 2, 2]);
        let mut log = log_with_terms(&[1, 1, 1]);
        log.set_commit_position(1);

        let mut client = LeaderClient {
            leader,
            max_bytes: 4096,
            sent: Vec::new(),
            pending: VecDeque::new(),
        };
        let reached = replicate(&mut client, &mut log, 1, 4, TIMEOUT).await.unwrap();
        assert_eq!(reached, 4);
        assert_eq!(log.last_position(), 4);
        assert_eq!(log.term_at(2).unwrap(), Some(2));
        assert_eq!(log.last_term(), 2);
    }

    #[tokio::test]
    async fn test_conflict_below_commit_fails_the_pull() {
        let leader = log_with_terms(&[1, 2, 2]);
        let mut log = log_with_terms(&[1, 1, 1]);
        log.set_commit_position(2);

        let mut client = LeaderClient {
            leader,
            max_bytes: 4096,
            sent: Vec::new(),
            pending: VecDeque::new(),
        };
        let err = replicate(&mut client, &mut log, 1, 3, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ReplicationError::FailedAppend(_)));
        assert_eq!(log.term_at(2).unwrap(), Some(1));
    }

    #[test]
    fn test_serve_past_the_end() {
        let leader = leader_log(3);
        let request = ReplicateRequest {
            request_id: 9,
            from_position: 3,
        };
        let response = serve_replicate(&leader, &request, 1024).unwrap();
        assert_eq!(response.request_id, 9);
        assert_eq!(response.to_position, 3);
        assert!(!response.more_available);
        assert!(response.serialized_events.is_empty());
    }
}
