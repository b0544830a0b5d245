//! Message-oriented stream over a protocol.
//!
//! Inbound messages are pushed through `consume`; replies come back out. Byte
//! framing lives in [`crate::envelope`] and is composed around this layer by
//! [`crate::connection`].

use crate::protocol::{Message, Outcome, Protocol, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("protocol stream is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Ended,
    Failed,
}

pub struct ProtocolStream<P> {
    protocol: P,
    state: State,
}

impl<P: Protocol> ProtocolStream<P> {
    pub fn new(protocol: P) -> Self {
        Self {
            protocol,
            state: State::Open,
        }
    }

    /// Produce the first outbound message. Never called implicitly; the owner
    /// of the connection decides whether this side opens the exchange.
    pub async fn initiate(&mut self) -> Result<Message, StreamError> {
        self.ensure_open()?;
        match self.protocol.initiate().await {
            Ok(message) => Ok(message),
            Err(e) => {
                self.state = State::Failed;
                Err(e.into())
            }
        }
    }

    /// Feed one inbound message. `Outcome::Finished` ends the output; any error
    /// is terminal and later calls return `Closed`.
    pub async fn push(&mut self, message: Message) -> Result<Outcome, StreamError> {
        self.ensure_open()?;
        match self
            .protocol
            .consume(message.message_type, &message.payload)
            .await
        {
            Ok(Outcome::Finished) => {
                tracing::debug!("protocol finished; ending stream output");
                self.state = State::Ended;
                Ok(Outcome::Finished)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::warn!(error = %e, "protocol error; stream failed");
                self.state = State::Failed;
                Err(e.into())
            }
        }
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        match self.state {
            State::Open => Ok(()),
            State::Ended | State::Failed => Err(StreamError::Closed),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    pub fn is_failed(&self) -> bool {
        self.state == State::Failed
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    pub fn into_inner(self) -> P {
        self.protocol
    }
}
