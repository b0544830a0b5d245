//! Availability sub-protocol: ask a peer whether it holds an asset.
//!
//! Registered after the authenticator; every message is refused until the
//! connection's [`PeerGate`] reports the peer authenticated.

use async_trait::async_trait;

use crate::mutual::PeerGate;
use crate::protocol::{Message, Outcome, Protocol, ProtocolDescriptor, ProtocolError};
use crate::repository::{RepositoryBackend, RepositoryError, RepositoryId, SharedPool};

pub const MSG_QUERY: u8 = 0x00;
pub const MSG_PRESENT: u8 = 0x01;
pub const MSG_ABSENT: u8 = 0x02;
pub const MSG_CLOSE: u8 = 0x03;

pub const PROTOCOL_NAME: &str = "Availability";
pub const DESCRIPTOR: ProtocolDescriptor = ProtocolDescriptor::new(PROTOCOL_NAME, MSG_QUERY, MSG_CLOSE);

const ID_LEN: usize = 36;

/// A peer's answer to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Present { size: u64 },
    Absent,
}

/// `QUERY` payload: the 36-byte repository id followed by the UTF-8 asset name.
pub fn query(id: &RepositoryId, name: &str) -> Message {
    let mut payload = Vec::with_capacity(ID_LEN + name.len());
    payload.extend_from_slice(id.as_str().as_bytes());
    payload.extend_from_slice(name.as_bytes());
    Message::new(MSG_QUERY, payload)
}

pub fn close() -> Message {
    Message::empty(MSG_CLOSE)
}

/// Decode a `PRESENT` or `ABSENT` reply (local types).
pub fn parse_reply(message: &Message) -> Result<Answer, ProtocolError> {
    match message.message_type {
        MSG_PRESENT => {
            let size: [u8; 8] = message
                .payload
                .as_slice()
                .try_into()
                .map_err(|_| ProtocolError::Malformed("availability reply"))?;
            Ok(Answer::Present {
                size: u64::from_be_bytes(size),
            })
        }
        MSG_ABSENT if message.payload.is_empty() => Ok(Answer::Absent),
        MSG_ABSENT => Err(ProtocolError::Malformed("availability reply")),
        other => Err(ProtocolError::UnexpectedMessage(other)),
    }
}

fn decode_query(payload: &[u8]) -> Result<(RepositoryId, &str), ProtocolError> {
    if payload.len() <= ID_LEN {
        return Err(ProtocolError::Malformed("availability query"));
    }
    let (id, name) = payload.split_at(ID_LEN);
    let id = std::str::from_utf8(id)
        .ok()
        .and_then(|s| s.parse::<RepositoryId>().ok())
        .ok_or(ProtocolError::Malformed("availability query"))?;
    let name = std::str::from_utf8(name).map_err(|_| ProtocolError::Malformed("availability query"))?;
    Ok((id, name))
}

pub struct Availability {
    pool: Option<SharedPool>,
    gate: PeerGate,
    last_answer: Option<Answer>,
}

impl Availability {
    /// Answers queries from the shared pool.
    pub fn serving(pool: SharedPool, gate: PeerGate) -> Self {
        Self {
            pool: Some(pool),
            gate,
            last_answer: None,
        }
    }

    /// Asks queries; has nothing to serve.
    pub fn client(gate: PeerGate) -> Self {
        Self {
            pool: None,
            gate,
            last_answer: None,
        }
    }

    /// Most recent answer consumed on the client side.
    pub fn last_answer(&self) -> Option<Answer> {
        self.last_answer
    }

    async fn lookup(&self, pool: &SharedPool, payload: &[u8]) -> Result<Answer, ProtocolError> {
        let (id, name) = decode_query(payload)?;
        let repository = {
            let mut pool = pool.lock().await;
            pool.get(&id).await?
        };
        let Some(repository) = repository else {
            return Ok(Answer::Absent);
        };
        match repository.size(name).await {
            Ok(size) => Ok(Answer::Present { size }),
            Err(RepositoryError::NotFound(_) | RepositoryError::InvalidName(_)) => Ok(Answer::Absent),
            Err(e) => {
                tracing::warn!(repository = %id, name, error = %e, "availability lookup failed");
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl Protocol for Availability {
    fn descriptor(&self) -> ProtocolDescriptor {
        DESCRIPTOR
    }

    async fn consume(&mut self, message_type: u8, payload: &[u8]) -> Result<Outcome, ProtocolError> {
        if !self.gate.is_authenticated() {
            return Err(ProtocolError::Unauthenticated);
        }
        match message_type {
            MSG_QUERY => {
                let pool = self
                    .pool
                    .clone()
                    .ok_or(ProtocolError::UnexpectedMessage(MSG_QUERY))?;
                let reply = match self.lookup(&pool, payload).await? {
                    Answer::Present { size } => Message::new(MSG_PRESENT, size.to_be_bytes().to_vec()),
                    Answer::Absent => Message::empty(MSG_ABSENT),
                };
                Ok(Outcome::Reply(reply))
            }
            MSG_PRESENT | MSG_ABSENT if self.pool.is_none() => {
                let answer = parse_reply(&Message::new(message_type, payload.to_vec()))?;
                self.last_answer = Some(answer);
                Ok(Outcome::Idle)
            }
            MSG_CLOSE => Ok(Outcome::Finished),
            other => Err(ProtocolError::UnexpectedMessage(other)),
        }
    }
}
