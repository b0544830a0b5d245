//! Colossus storage node core.
//! Wire framing, sub-protocol multiplexing and peer authentication on one side;
//! repositories, byte ranges and upload policy for asset serving on the other.

pub mod availability;
pub mod connection;
pub mod envelope;
pub mod filter;
pub mod identity;
pub mod mutual;
pub mod mux;
pub mod protocol;
pub mod ranges;
pub mod repository;
pub mod stream;

pub use availability::{Answer, Availability};
pub use connection::{Connection, ConnectionError};
pub use envelope::{Deserializer, EnvelopeError, Serializer, DEFAULT_MAX_PAYLOAD};
pub use filter::{Accepted, UploadPolicy, UploadRejected};
pub use identity::{Keypair, PublicKey};
pub use mutual::{AuthState, MutualAuthenticator, PeerGate};
pub use mux::Multiplexer;
pub use protocol::{Message, Outcome, Protocol, ProtocolDescriptor, ProtocolError};
pub use ranges::{ByteRange, RangeError, RangeHeader, ServePlan, Span};
pub use repository::{
    BackendKind, Repository, RepositoryBackend, RepositoryError, RepositoryId, RepositoryPool,
    SharedPool,
};
pub use stream::{ProtocolStream, StreamError};
