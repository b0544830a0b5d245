//! Sub-protocol interface: message shape, descriptors and the `Protocol` trait.

use async_trait::async_trait;

use crate::repository::RepositoryError;

/// One decoded `(type, payload)` tuple. Type numbering is local to whichever
/// protocol is looking at it; the multiplexer translates between spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(message_type: u8, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    pub fn empty(message_type: u8) -> Self {
        Self::new(message_type, Vec::new())
    }
}

/// Name and inclusive message-type range claimed by a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    pub name: &'static str,
    pub low: u8,
    pub high: u8,
}

impl ProtocolDescriptor {
    pub const fn new(name: &'static str, low: u8, high: u8) -> Self {
        Self { name, low, high }
    }

    /// Number of message types covered; zero if the range is inverted.
    pub fn width(&self) -> u16 {
        if self.low > self.high {
            0
        } else {
            u16::from(self.high - self.low) + 1
        }
    }

    pub fn contains(&self, message_type: u8) -> bool {
        (self.low..=self.high).contains(&message_type)
    }
}

/// Result of consuming one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send this message back to the peer.
    Reply(Message),
    /// Consumed; nothing to send, keep the exchange open.
    Idle,
    /// Consumed; the protocol has no more output. Ends the stream.
    Finished,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("protocol {name} declares inverted range [{low}, {high}]")]
    InvalidRange { name: &'static str, low: u8, high: u8 },
    #[error("protocol {name} maps onto global type {global}, already taken")]
    RangeCollision { name: &'static str, global: u16 },
    #[error("protocol {name} replied with type {message_type} outside its range")]
    ResponseOutOfRange { name: &'static str, message_type: u8 },
    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),
    #[error("peer is not authenticated")]
    Unauthenticated,
    #[error("malformed {0} message")]
    Malformed(&'static str),
    #[error("unexpected message type {0}")]
    UnexpectedMessage(u8),
    #[error("no registered protocol can initiate ({0})")]
    CannotInitiate(&'static str),
    #[error("no protocol registered at index {0}")]
    UnknownProtocol(usize),
    #[error("repository: {0}")]
    Repository(#[from] RepositoryError),
}

/// A self-contained message handler with its own local type numbering.
#[async_trait]
pub trait Protocol: Send {
    fn descriptor(&self) -> ProtocolDescriptor;

    /// Whether `initiate` produces an opening message.
    fn can_initiate(&self) -> bool {
        false
    }

    /// Produce the first outbound message of an exchange.
    async fn initiate(&mut self) -> Result<Message, ProtocolError> {
        Err(ProtocolError::CannotInitiate(self.descriptor().name))
    }

    async fn consume(&mut self, message_type: u8, payload: &[u8]) -> Result<Outcome, ProtocolError>;
}

#[async_trait]
impl<P: Protocol + ?Sized> Protocol for Box<P> {
    fn descriptor(&self) -> ProtocolDescriptor {
        (**self).descriptor()
    }

    fn can_initiate(&self) -> bool {
        (**self).can_initiate()
    }

    async fn initiate(&mut self) -> Result<Message, ProtocolError> {
        (**self).initiate().await
    }

    async fn consume(&mut self, message_type: u8, payload: &[u8]) -> Result<Outcome, ProtocolError> {
        (**self).consume(message_type, payload).await
    }
}
