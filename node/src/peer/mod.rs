pub mod handler;
pub mod service;

use async_trait::async_trait;
use utilities::{
    error::RemoteError,
    ring::{FileInfo, NodeInfo},
};

/// Operations a remote node exposes to its peers.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Asks the peer to fetch `file_name` from `requester`. Returns once the
    /// peer queued the request, the transfer itself runs on the peer.
    async fn request_download(&self, requester: &NodeInfo, file_name: &str) -> Result<(), RemoteError>;
    /// Tells the peer it now holds a replica of the file.
    async fn set_owner_file(&self, file_info: &FileInfo) -> Result<(), RemoteError>;
}

/// Lookup of a peer handle by address.
pub trait PeerRegistry: Send + Sync {
    fn lookup(&self, address: &str) -> Box<dyn PeerHandle>;
}
