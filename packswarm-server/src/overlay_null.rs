//! Placeholder [`Overlay`] implementation wired in until a real swarm
//! (libp2p-style DHT, stream multiplexing, NAT traversal) is plugged in —
//! the overlay itself is an external collaborator out of scope for this
//! daemon. It reports no peers and no providers, so the
//! fetch orchestrator always falls through to the mirror path, and the
//! fleet coordinator always elects itself as the WAN fetcher.
//!
//! A production deployment replaces [`NullOverlay`] with its own `Overlay`
//! impl and feeds the decoded inbound stream (fleet messages on
//! [`packswarm_core::overlay::FLEET_PROTOCOL_ID`], transfer requests on
//! [`packswarm_core::orchestrator::peer_transfer::PEER_TRANSFER_PROTOCOL_ID`])
//! into the channels this crate exposes — the fleet side is
//! `Context::fleet_inbound()`, set up once in `main` and reachable from
//! any handle that holds the shared `Context`.

use async_trait::async_trait;
use bytes::Bytes;
use packswarm_core::digest::Digest;
use packswarm_core::overlay::{Overlay, OverlayError, PeerId, PeerStream};

pub struct NullOverlay;

#[async_trait]
impl Overlay for NullOverlay {
    async fn find_providers(&self, _digest: Digest, _limit: usize) -> Result<Vec<PeerId>, OverlayError> {
        Ok(Vec::new())
    }

    async fn provide(&self, _digest: Digest) -> Result<(), OverlayError> {
        Ok(())
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        _protocol_id: &str,
    ) -> Result<Box<dyn PeerStream>, OverlayError> {
        Err(OverlayError::NotConnected(peer.clone()))
    }

    async fn send_message(&self, peer: &PeerId, _protocol_id: &str, _message: Bytes) -> Result<(), OverlayError> {
        Err(OverlayError::NotConnected(peer.clone()))
    }

    async fn broadcast(&self, _protocol_id: &str, _message: Bytes) -> Result<(), OverlayError> {
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        Vec::new()
    }

    async fn routing_table_size(&self) -> usize {
        0
    }
}
