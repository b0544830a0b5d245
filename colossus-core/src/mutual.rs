//! Mutual challenge-response authentication between two key-holding nodes.
//!
//! Three messages, all boxed with the static X25519 keys of both sides:
//!
//! ```text
//! initiator                                   responder
//!   CHALLENGE  own_pk || box(n_i)        ->
//!                                        <-   RESPONSE  box(n_i || n_r)
//!   FINALIZE   box_{n_r}(n_r)            ->
//! ```
//!
//! Opening a box proves the sender holds the secret matching the public key the
//! receiver used. Echoing `n_i` back proves the responder opened the challenge;
//! echoing `n_r` proves the initiator opened the response. Any failure is fatal
//! and leaves the session in `Failed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::identity::{Keypair, PublicKey, PUBLIC_KEY_SIZE};
use crate::protocol::{Message, Outcome, Protocol, ProtocolDescriptor, ProtocolError};

pub const MSG_CHALLENGE: u8 = 0x00;
pub const MSG_RESPONSE: u8 = 0x01;
pub const MSG_FINALIZE: u8 = 0x02;

/// Slots kept free above the last message so later revisions keep their numbering.
const RESERVED_MESSAGE_SLOTS: u8 = 10;

pub const PROTOCOL_NAME: &str = "MutualAuthenticator";
pub const DESCRIPTOR: ProtocolDescriptor =
    ProtocolDescriptor::new(PROTOCOL_NAME, MSG_CHALLENGE, MSG_FINALIZE + RESERVED_MESSAGE_SLOTS);

/// Size of each side's random challenge.
pub const NONCE_SIZE: usize = 32;

const CHALLENGE_CONTEXT: &[u8] = b"mutual/challenge";
const RESPONSE_CONTEXT: &[u8] = b"mutual/response";
const FINALIZE_CONTEXT: &[u8] = b"mutual/finalize";

type Nonce = [u8; NONCE_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unstarted,
    Challenged,
    Authenticated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// Shared view of whether the peer on a connection has been authenticated.
/// Handed to sibling sub-protocols, which must check it before acting on peer data.
#[derive(Debug, Clone, Default)]
pub struct PeerGate(Arc<AtomicBool>);

impl PeerGate {
    pub fn is_authenticated(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, authenticated: bool) {
        self.0.store(authenticated, Ordering::Release);
    }
}

fn random_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn finalize_context(responder_nonce: &Nonce) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(FINALIZE_CONTEXT.len() + NONCE_SIZE);
    ctx.extend_from_slice(FINALIZE_CONTEXT);
    ctx.extend_from_slice(responder_nonce);
    ctx
}

/// One side of a handshake. Owned by exactly one connection.
pub struct MutualAuthenticator {
    keypair: Arc<Keypair>,
    peer_key: Option<PublicKey>,
    role: Option<Role>,
    nonce_local: Option<Nonce>,
    nonce_remote: Option<Nonce>,
    state: AuthState,
    gate: PeerGate,
}

impl MutualAuthenticator {
    /// `peer_key` is required to initiate. A responder may leave it unset to
    /// accept any peer that proves possession of the key it advertises.
    pub fn new(keypair: Arc<Keypair>, peer_key: Option<PublicKey>) -> Self {
        Self {
            keypair,
            peer_key,
            role: None,
            nonce_local: None,
            nonce_remote: None,
            state: AuthState::Unstarted,
            gate: PeerGate::default(),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn peer_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Public key of the peer, once known.
    pub fn peer_key(&self) -> Option<&PublicKey> {
        self.peer_key.as_ref()
    }

    pub fn gate(&self) -> PeerGate {
        self.gate.clone()
    }

    fn id(&self) -> String {
        self.keypair.public_key().short()
    }

    fn fail(&mut self, reason: &'static str) -> ProtocolError {
        tracing::warn!(node = %self.id(), reason, "mutual authentication failed");
        self.state = AuthState::Failed;
        self.nonce_local = None;
        self.nonce_remote = None;
        self.gate.set(false);
        ProtocolError::AuthenticationFailed(reason)
    }

    fn expect(&mut self, state: AuthState, role: Option<Role>) -> Result<(), ProtocolError> {
        if self.state != state || self.role != role {
            return Err(self.fail("message out of sequence"));
        }
        Ok(())
    }

    /// Initiator, `Unstarted -> Challenged`: challenge the known peer key.
    pub fn challenge(&mut self) -> Result<Message, ProtocolError> {
        self.expect(AuthState::Unstarted, None)?;
        let Some(peer) = self.peer_key else {
            return Err(self.fail("peer public key unknown"));
        };
        let nonce = random_nonce();
        let sealed = match self.keypair.seal(&peer, CHALLENGE_CONTEXT, &nonce) {
            Ok(sealed) => sealed,
            Err(_) => return Err(self.fail("cannot seal challenge")),
        };
        let mut payload = Vec::with_capacity(PUBLIC_KEY_SIZE + sealed.len());
        payload.extend_from_slice(self.keypair.public_key().as_bytes());
        payload.extend_from_slice(&sealed);

        self.role = Some(Role::Initiator);
        self.nonce_local = Some(nonce);
        self.state = AuthState::Challenged;
        tracing::debug!(node = %self.id(), peer = %peer.short(), "sent challenge");
        Ok(Message::new(MSG_CHALLENGE, payload))
    }

    /// Responder, `Unstarted -> Challenged`: open the challenge, answer with both nonces.
    pub fn mutual_challenge(&mut self, payload: &[u8]) -> Result<Message, ProtocolError> {
        self.expect(AuthState::Unstarted, None)?;
        let Some(claimed) = PublicKey::from_slice(payload) else {
            return Err(self.fail("challenge too short"));
        };
        if let Some(expected) = self.peer_key {
            if expected != claimed {
                return Err(self.fail("peer public key does not match expectation"));
            }
        }
        let opened = match self
            .keypair
            .open(&claimed, CHALLENGE_CONTEXT, &payload[PUBLIC_KEY_SIZE..])
        {
            Ok(opened) => opened,
            Err(_) => return Err(self.fail("cannot open challenge")),
        };
        let Ok(remote) = Nonce::try_from(opened.as_slice()) else {
            return Err(self.fail("challenge nonce has wrong size"));
        };

        let local = random_nonce();
        let mut reply = Vec::with_capacity(2 * NONCE_SIZE);
        reply.extend_from_slice(&remote);
        reply.extend_from_slice(&local);
        let sealed = match self.keypair.seal(&claimed, RESPONSE_CONTEXT, &reply) {
            Ok(sealed) => sealed,
            Err(_) => return Err(self.fail("cannot seal response")),
        };

        self.role = Some(Role::Responder);
        self.peer_key = Some(claimed);
        self.nonce_remote = Some(remote);
        self.nonce_local = Some(local);
        self.state = AuthState::Challenged;
        tracing::debug!(node = %self.id(), peer = %claimed.short(), "answered challenge");
        Ok(Message::new(MSG_RESPONSE, sealed))
    }

    /// Initiator, `Challenged -> Authenticated`: check our nonce came back, prove
    /// we read the responder's.
    pub fn final_reply(&mut self, payload: &[u8]) -> Result<Message, ProtocolError> {
        self.expect(AuthState::Challenged, Some(Role::Initiator))?;
        let (Some(peer), Some(sent)) = (self.peer_key, self.nonce_local) else {
            return Err(self.fail("session state incomplete"));
        };
        let opened = match self.keypair.open(&peer, RESPONSE_CONTEXT, payload) {
            Ok(opened) => opened,
            Err(_) => return Err(self.fail("cannot open response")),
        };
        if opened.len() != 2 * NONCE_SIZE {
            return Err(self.fail("response has wrong size"));
        }
        let (echoed, remote) = opened.split_at(NONCE_SIZE);
        if echoed != sent.as_slice() {
            return Err(self.fail("response does not echo our challenge"));
        }
        let Ok(remote) = Nonce::try_from(remote) else {
            return Err(self.fail("response nonce has wrong size"));
        };
        let sealed = match self.keypair.seal(&peer, &finalize_context(&remote), &remote) {
            Ok(sealed) => sealed,
            Err(_) => return Err(self.fail("cannot seal confirmation")),
        };

        self.nonce_remote = Some(remote);
        self.state = AuthState::Authenticated;
        self.gate.set(true);
        tracing::debug!(node = %self.id(), peer = %peer.short(), "peer authenticated");
        Ok(Message::new(MSG_FINALIZE, sealed))
    }

    /// Responder, `Challenged -> Authenticated`: verify the confirmation of our nonce.
    pub fn consume_final(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.expect(AuthState::Challenged, Some(Role::Responder))?;
        let (Some(peer), Some(local)) = (self.peer_key, self.nonce_local) else {
            return Err(self.fail("session state incomplete"));
        };
        let opened = match self.keypair.open(&peer, &finalize_context(&local), payload) {
            Ok(opened) => opened,
            Err(_) => return Err(self.fail("cannot open confirmation")),
        };
        if opened != local {
            return Err(self.fail("confirmation does not echo our challenge"));
        }
        self.state = AuthState::Authenticated;
        self.gate.set(true);
        tracing::debug!(node = %self.id(), peer = %peer.short(), "peer authenticated");
        Ok(())
    }
}

#[async_trait]
impl Protocol for MutualAuthenticator {
    fn descriptor(&self) -> ProtocolDescriptor {
        DESCRIPTOR
    }

    fn can_initiate(&self) -> bool {
        true
    }

    async fn initiate(&mut self) -> Result<Message, ProtocolError> {
        self.challenge()
    }

    async fn consume(&mut self, message_type: u8, payload: &[u8]) -> Result<Outcome, ProtocolError> {
        if self.state == AuthState::Failed {
            return Err(ProtocolError::AuthenticationFailed("session already failed"));
        }
        match message_type {
            MSG_CHALLENGE => self.mutual_challenge(payload).map(Outcome::Reply),
            MSG_RESPONSE => self.final_reply(payload).map(Outcome::Reply),
            MSG_FINALIZE => self.consume_final(payload).map(|()| Outcome::Idle),
            other => {
                self.fail("reserved message type");
                Err(ProtocolError::UnknownMessageType(other))
            }
        }
    }
}
