//! Collaborators the exchange talks to but does not implement
//!
//! [`Network`] delivers messages to peers and [`ContentRouting`] announces
//! that we can serve a CID. Real transports and DHTs live outside this crate;
//! the `Null*` implementations let a node run standalone.

use async_trait::async_trait;
use cid::Cid;
use libp2p::PeerId;
use tracing::debug;

use crate::message::Message;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Peer {0} is not connected")]
    PeerNotConnected(PeerId),

    #[error("Failed to send message to {peer}: {reason}")]
    SendFailed { peer: PeerId, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Failed to provide {cid}: {reason}")]
    ProvideFailed { cid: Cid, reason: String },

    #[error("Content routing unavailable")]
    Unavailable,
}

#[async_trait]
pub trait Network: Send + Sync {
    async fn send_message(&self, peer: &PeerId, message: Message) -> Result<(), NetworkError>;
}

#[async_trait]
pub trait ContentRouting: Send + Sync {
    /// Announce that the local node can serve `cid`
    async fn provide(&self, cid: &Cid) -> Result<(), RoutingError>;
}

/// Network with no peers: every send fails with `PeerNotConnected`
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNetwork;

#[async_trait]
impl Network for NullNetwork {
    async fn send_message(&self, peer: &PeerId, message: Message) -> Result<(), NetworkError> {
        debug!(
            "No transport, dropping message for {} ({} blocks)",
            peer,
            message.blocks.len()
        );
        Err(NetworkError::PeerNotConnected(*peer))
    }
}

/// Routing that accepts and forgets every announcement
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRouting;

#[async_trait]
impl ContentRouting for NullRouting {
    async fn provide(&self, cid: &Cid) -> Result<(), RoutingError> {
        debug!("Provide {} (no routing configured)", cid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Block;
    use libp2p::identity::Keypair;

    #[tokio::test]
    async fn test_null_collaborators() {
        let peer = PeerId::from(Keypair::generate_secp256k1().public());
        let err = NullNetwork
            .send_message(&peer, Message::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::PeerNotConnected(p) if p == peer));

        let cid = Block::new(&b"x"[..]).unwrap().cid;
        NullRouting.provide(&cid).await.unwrap();
    }
}
