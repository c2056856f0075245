// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{NodeId, RaftError, RaftResult, Term};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: NodeId,
    pub last_log_position: i64,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: NodeId,
    pub previous_position: i64,
    pub previous_term: Term,
    pub commit_position: i64,
    /// Serialized frames following `previous_position`; empty for heartbeats.
    pub entries: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: Term,
    pub succeeded: bool,
    /// On success the last position known to match the leader, otherwise
    /// the follower's last position.
    pub previous_position: i64,
    pub node: NodeId,
}

/// Asks for the entries after `from_position`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub request_id: u64,
    pub from_position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateResponse {
    pub request_id: u64,
    /// Position of the last entry in `serialized_events`.
    pub to_position: i64,
    pub more_available: bool,
    pub serialized_events: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    Vote(VoteRequest),
    Append(AppendRequest),
    Replicate(ReplicateRequest),
}

impl RaftRequest {
    /// Path segment of the HTTP endpoint serving this request.
    pub fn endpoint(&self) -> &'static str {
        match self {
            RaftRequest::Vote(_) => "vote",
            RaftRequest::Append(_) => "append",
            RaftRequest::Replicate(_) => "replicate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    Vote(VoteResponse),
    Append(AppendResponse),
    Replicate(ReplicateResponse),
}

pub fn encode<T: Serialize>(message: &T) -> RaftResult<Vec<u8>> {
    bincode::serde::encode_to_vec(message, bincode::config::standard()).map_err(|e| RaftError::Encoding(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> RaftResult<T> {
    let (message, read): (T, usize) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| RaftError::Encoding(e.to_string()))?;
    if read != bytes.len() {
        return Err(RaftError::Encoding(format!("{} trailing bytes", bytes.len() - read)));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_request_on_the_wire() {
        let request = RaftRequest::Append(AppendRequest {
            term: 3,
            leader: 2,
            previous_position: 41,
            previous_term: 2,
            commit_position: 40,
            entries: vec![1, 2, 3, 4, 5, 6, 7, 8],
        });
        let bytes = encode(&request).unwrap();
        assert_eq!(decode::<RaftRequest>(&bytes).unwrap(), request);
        assert_eq!(request.endpoint(), "append");
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = encode(&VoteResponse { term: 1, granted: true }).unwrap();
        bytes.push(0);
        assert!(matches!(decode::<VoteResponse>(&bytes), Err(RaftError::Encoding(_))));
    }
}
