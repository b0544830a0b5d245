//! Peer transport: TCP listener running the protocol stack, and a one-shot
//! availability query for the `query` command.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use colossus_core::availability::{self, Answer, Availability};
use colossus_core::{
    Connection, Keypair, Multiplexer, MutualAuthenticator, PeerGate, Protocol, ProtocolError,
    PublicKey, RepositoryId, SharedPool,
};
use tokio::net::{TcpListener, TcpStream};

/// Position of the availability protocol in the stack.
const AVAILABILITY: usize = 1;

/// Authenticator first: the multiplexer only lets the first initiating protocol open.
fn stack(
    keypair: Arc<Keypair>,
    peer_key: Option<PublicKey>,
    pool: Option<SharedPool>,
) -> Result<(Multiplexer, PeerGate), ProtocolError> {
    let auth = MutualAuthenticator::new(keypair, peer_key);
    let gate = auth.gate();
    let availability = match pool {
        Some(pool) => Availability::serving(pool, gate.clone()),
        None => Availability::client(gate.clone()),
    };
    let protocols: Vec<Box<dyn Protocol>> = vec![Box::new(auth), Box::new(availability)];
    Ok((Multiplexer::new(protocols)?, gate))
}

/// Bind the peer port and serve connections until the listener fails.
pub async fn run_transport(
    port: u16,
    keypair: Arc<Keypair>,
    pool: SharedPool,
    max_payload: usize,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, key = %keypair.public_key(), "peer transport listening");
    serve(listener, keypair, pool, max_payload).await
}

pub async fn serve(
    listener: TcpListener,
    keypair: Arc<Keypair>,
    pool: SharedPool,
    max_payload: usize,
) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let keypair = keypair.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            handle_peer(stream, addr, keypair, pool, max_payload).await;
        });
    }
}

async fn handle_peer(
    stream: TcpStream,
    addr: SocketAddr,
    keypair: Arc<Keypair>,
    pool: SharedPool,
    max_payload: usize,
) {
    let (mux, gate) = match stack(keypair, None, Some(pool)) {
        Ok(parts) => parts,
        Err(e) => {
            tracing::error!(error = %e, "cannot build protocol stack");
            return;
        }
    };
    let mut conn = Connection::new(stream, mux, gate, max_payload);
    tracing::debug!(%addr, "peer connected");
    match conn.serve().await {
        Ok(()) => tracing::debug!(%addr, "peer disconnected"),
        Err(e) => tracing::warn!(%addr, error = %e, "peer connection dropped"),
    }
}

/// Connect to `addr`, authenticate against `peer_key` and ask for one asset.
pub async fn query_peer(
    addr: SocketAddr,
    keypair: Arc<Keypair>,
    peer_key: PublicKey,
    id: &RepositoryId,
    name: &str,
    max_payload: usize,
) -> anyhow::Result<Answer> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let (mux, gate) = stack(keypair, Some(peer_key), None)?;
    let mut conn = Connection::new(stream, mux, gate, max_payload);
    conn.authenticate(true).await.context("handshake")?;
    let reply = conn
        .request(AVAILABILITY, availability::query(id, name))
        .await?;
    let answer = availability::parse_reply(&reply)?;
    conn.send(AVAILABILITY, availability::close()).await?;
    Ok(answer)
}
