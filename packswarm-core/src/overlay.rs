//! The overlay (DHT/transport) is consumed as a trait boundary, not
//! implemented here — a real deployment plugs in a libp2p-style swarm;
//! tests plug in a `mockall` double.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::digest::Digest;

pub type PeerId = String;

/// A bidirectional byte stream opened to a single peer over one protocol id.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerStream for T {}

pub const FLEET_PROTOCOL_ID: &str = "/packswarm/fleet/1.0.0";

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("no connection to peer {0}")]
    NotConnected(PeerId),
    #[error("overlay transport error: {0}")]
    Transport(String),
}

/// External collaborator's surface, as consumed by the fleet coordinator and
/// fetch orchestrator. Routing-table maintenance, peer discovery, and wire
/// encryption are entirely the implementer's concern.
#[async_trait]
pub trait Overlay: Send + Sync {
    async fn find_providers(&self, digest: Digest, limit: usize) -> Result<Vec<PeerId>, OverlayError>;

    async fn provide(&self, digest: Digest) -> Result<(), OverlayError>;

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol_id: &str,
    ) -> Result<Box<dyn PeerStream>, OverlayError>;

    async fn send_message(&self, peer: &PeerId, protocol_id: &str, message: Bytes) -> Result<(), OverlayError>;

    async fn broadcast(&self, protocol_id: &str, message: Bytes) -> Result<(), OverlayError>;

    async fn connected_peers(&self) -> Vec<PeerId>;

    async fn routing_table_size(&self) -> usize;
}
