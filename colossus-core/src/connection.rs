//! One peer connection: envelope framing around a multiplexed protocol stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::{Deserializer, EnvelopeError, Serializer};
use crate::mutual::PeerGate;
use crate::mux::Multiplexer;
use crate::protocol::{Message, Outcome, ProtocolError};
use crate::stream::{ProtocolStream, StreamError};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connection closed mid-exchange")]
    UnexpectedEof,
}

/// Owns the transport and every per-connection session. Dropping it releases them.
pub struct Connection<S> {
    io: S,
    serializer: Serializer,
    deserializer: Deserializer,
    stream: ProtocolStream<Multiplexer>,
    gate: PeerGate,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// `gate` must be the gate of the authenticator registered in `mux`.
    pub fn new(io: S, mux: Multiplexer, gate: PeerGate, max_payload: usize) -> Self {
        Self {
            io,
            serializer: Serializer::new(max_payload),
            deserializer: Deserializer::new(max_payload),
            stream: ProtocolStream::new(mux),
            gate,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.gate.is_authenticated()
    }

    /// Next framed message, or `None` on a clean end of stream.
    pub async fn read_message(&mut self) -> Result<Option<Message>, ConnectionError> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if let Some(message) = self.deserializer.next_message()? {
                return Ok(Some(message));
            }
            let n = self.io.read(&mut buf).await?;
            if n == 0 {
                if self.deserializer.pending() > 0 {
                    return Err(ConnectionError::UnexpectedEof);
                }
                return Ok(None);
            }
            self.deserializer.feed(&buf[..n]);
        }
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<(), ConnectionError> {
        let frame = self.serializer.write(message)?;
        self.io.write_all(&frame).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Run the handshake to completion. The initiating side sends the opening
    /// challenge; both sides then pump messages until the gate opens.
    pub async fn authenticate(&mut self, initiate: bool) -> Result<(), ConnectionError> {
        if initiate {
            let opening = self.stream.initiate().await?;
            self.write_message(&opening).await?;
        }
        while !self.gate.is_authenticated() {
            let message = self
                .read_message()
                .await?
                .ok_or(ConnectionError::UnexpectedEof)?;
            match self.stream.push(message).await? {
                Outcome::Reply(reply) => self.write_message(&reply).await?,
                Outcome::Idle => {}
                Outcome::Finished => return Err(StreamError::Closed.into()),
            }
        }
        tracing::debug!("connection authenticated");
        Ok(())
    }

    /// Responder loop: answer every inbound message until the peer hangs up or a
    /// sub-protocol finishes the exchange.
    pub async fn serve(&mut self) -> Result<(), ConnectionError> {
        while let Some(message) = self.read_message().await? {
            match self.stream.push(message).await? {
                Outcome::Reply(reply) => self.write_message(&reply).await?,
                Outcome::Idle => {}
                Outcome::Finished => {
                    tracing::debug!("exchange finished by peer");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Send a message in the local numbering of sub-protocol `index` without
    /// waiting for an answer.
    pub async fn send(&mut self, index: usize, message: Message) -> Result<(), ConnectionError> {
        let global = self.stream.protocol().outbound(index, message)?;
        self.write_message(&global).await
    }

    /// Send a message for sub-protocol `index` and return its reply, translated
    /// back into that sub-protocol's numbering.
    pub async fn request(&mut self, index: usize, message: Message) -> Result<Message, ConnectionError> {
        self.send(index, message).await?;
        let reply = self
            .read_message()
            .await?
            .ok_or(ConnectionError::UnexpectedEof)?;
        let (owner, local) = self.stream.protocol().inbound(reply)?;
        if owner != index {
            return Err(ProtocolError::UnexpectedMessage(local.message_type).into());
        }
        Ok(local)
    }

    pub fn into_inner(self) -> S {
        self.io
    }
}
