//! Typed commands and responses.
//!
//! The transport decodes length-framed buffers into [`Command`]s before they
//! reach a shard; a shard answers every command with exactly one [`Response`].

use crate::error::ErrorKind;
use crate::types::{CommandId, CorrelationToken, Key, Lsn};
use crate::value::VectorRecord;

/// Command discriminant. Byte values are stable: mutation kinds are also
/// written into WAL record headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    /// Insert or replace a vector record
    Upsert = 1,
    /// k-nearest-neighbor search
    Search = 2,
    /// Delete a key (writes a tombstone)
    Delete = 3,
    /// Point read
    Get = 4,
}

impl CommandKind {
    /// Stable byte tag.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parse a byte tag.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(CommandKind::Upsert),
            2 => Some(CommandKind::Search),
            3 => Some(CommandKind::Delete),
            4 => Some(CommandKind::Get),
            _ => None,
        }
    }

    /// Whether this kind writes the WAL.
    pub fn is_mutation(self) -> bool {
        matches!(self, CommandKind::Upsert | CommandKind::Delete)
    }
}

/// Parameters of a k-NN search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    /// Query vector
    pub query: Vec<f32>,
    /// Number of results
    pub k: usize,
    /// Beam width for graph traversal; `None` uses the configured default
    pub breadth: Option<usize>,
}

/// Command body.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    /// Insert or replace
    Upsert {
        /// Target key
        key: Key,
        /// New record
        record: VectorRecord,
    },
    /// Delete
    Delete {
        /// Target key
        key: Key,
    },
    /// k-NN search
    Search(SearchRequest),
    /// Point read
    Get {
        /// Target key
        key: Key,
    },
}

/// An immutable, typed command.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Ingress-assigned identifier
    pub id: CommandId,
    /// Echoed on the response
    pub correlation: CorrelationToken,
    /// Body
    pub payload: CommandPayload,
}

impl Command {
    /// Build an upsert.
    pub fn upsert(id: u64, key: impl Into<Key>, record: VectorRecord) -> Self {
        Command {
            id: CommandId(id),
            correlation: CorrelationToken(id),
            payload: CommandPayload::Upsert {
                key: key.into(),
                record,
            },
        }
    }

    /// Build a delete.
    pub fn delete(id: u64, key: impl Into<Key>) -> Self {
        Command {
            id: CommandId(id),
            correlation: CorrelationToken(id),
            payload: CommandPayload::Delete { key: key.into() },
        }
    }

    /// Build a search.
    pub fn search(id: u64, query: Vec<f32>, k: usize) -> Self {
        Command {
            id: CommandId(id),
            correlation: CorrelationToken(id),
            payload: CommandPayload::Search(SearchRequest {
                query,
                k,
                breadth: None,
            }),
        }
    }

    /// Build a point read.
    pub fn get(id: u64, key: impl Into<Key>) -> Self {
        Command {
            id: CommandId(id),
            correlation: CorrelationToken(id),
            payload: CommandPayload::Get { key: key.into() },
        }
    }

    /// Replace the correlation token (builder pattern).
    pub fn with_correlation(mut self, token: CorrelationToken) -> Self {
        self.correlation = token;
        self
    }

    /// Discriminant.
    pub fn kind(&self) -> CommandKind {
        match &self.payload {
            CommandPayload::Upsert { .. } => CommandKind::Upsert,
            CommandPayload::Delete { .. } => CommandKind::Delete,
            CommandPayload::Search(_) => CommandKind::Search,
            CommandPayload::Get { .. } => CommandKind::Get,
        }
    }

    /// Key the command is routed by; searches are not key-routed.
    pub fn routing_key(&self) -> Option<&Key> {
        match &self.payload {
            CommandPayload::Upsert { key, .. }
            | CommandPayload::Delete { key }
            | CommandPayload::Get { key } => Some(key),
            CommandPayload::Search(_) => None,
        }
    }

    /// Whether the command writes the WAL.
    pub fn is_mutation(&self) -> bool {
        self.kind().is_mutation()
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Origin key
    pub key: Key,
    /// Exact distance under the index metric
    pub distance: f32,
}

/// Response status.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    /// Success
    Ok,
    /// Failure with its taxonomy class
    Error {
        /// Class
        kind: ErrorKind,
        /// Human-readable detail
        message: String,
    },
}

impl Status {
    /// Whether this is `Ok`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Error class, if any.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Status::Ok => None,
            Status::Error { kind, .. } => Some(*kind),
        }
    }
}

/// Response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// No result
    Empty,
    /// Mutation made durable at this LSN
    Committed {
        /// LSN of the WAL record
        lsn: Lsn,
    },
    /// Point read result (`None` = not found or deleted)
    Value(Option<VectorRecord>),
    /// Search results, nearest first
    Hits(Vec<SearchHit>),
}

/// Outbound response, handed to the transport for encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Echo of the command's token
    pub correlation: CorrelationToken,
    /// Status
    pub status: Status,
    /// Body
    pub payload: ResponsePayload,
}

impl Response {
    /// Successful response.
    pub fn ok(correlation: CorrelationToken, payload: ResponsePayload) -> Self {
        Response {
            correlation,
            status: Status::Ok,
            payload,
        }
    }

    /// Failed response with an empty body.
    pub fn error(correlation: CorrelationToken, err: &crate::Error) -> Self {
        Response {
            correlation,
            status: Status::Error {
                kind: err.kind(),
                message: err.to_string(),
            },
            payload: ResponsePayload::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_bytes_are_stable() {
        assert_eq!(CommandKind::Upsert.as_byte(), 1);
        assert_eq!(CommandKind::Search.as_byte(), 2);
        assert_eq!(CommandKind::Delete.as_byte(), 3);
        assert_eq!(CommandKind::Get.as_byte(), 4);
        for b in 1..=4 {
            assert_eq!(CommandKind::from_byte(b).unwrap().as_byte(), b);
        }
        assert!(CommandKind::from_byte(0).is_none());
    }

    #[test]
    fn test_routing_key() {
        let up = Command::upsert(1, "a", VectorRecord::from_vector(vec![1.0]));
        assert_eq!(up.routing_key(), Some(&Key::from("a")));
        assert!(up.is_mutation());
        let s = Command::search(2, vec![1.0], 3);
        assert!(s.routing_key().is_none());
        assert!(!s.is_mutation());
    }

    #[test]
    fn test_error_response_carries_kind() {
        let err = crate::Error::Overloaded {
            outstanding: 256,
            high_watermark: 256,
        };
        let resp = Response::error(CorrelationToken(9), &err);
        assert_eq!(resp.status.error_kind(), Some(ErrorKind::Overloaded));
        assert_eq!(resp.payload, ResponsePayload::Empty);
    }
}
