use async_trait::async_trait;
use utilities::{
    data_packet::DataPacket,
    error::RemoteError,
    logger::{instrument, trace, tracing},
    ring::{FileInfo, NodeInfo},
    tcp_pool::TcpPool,
};

use super::{PeerHandle, PeerRegistry};
use crate::lock_coordinator::LockState;

/// `PeerRegistry` reaching peers over the node wire protocol.
#[derive(Clone, Debug, Default)]
pub struct PeerService {
    pool: TcpPool,
}

impl PeerService {
    pub fn new(pool: TcpPool) -> Self {
        Self { pool }
    }
    pub fn peer(&self, address: &str) -> RemotePeer {
        RemotePeer {
            address: address.to_owned(),
            pool: self.pool.clone(),
        }
    }
}

impl PeerRegistry for PeerService {
    fn lookup(&self, address: &str) -> Box<dyn PeerHandle> {
        Box::new(self.peer(address))
    }
}

#[derive(Clone, Debug)]
pub struct RemotePeer {
    address: String,
    pool: TcpPool,
}

impl RemotePeer {
    pub fn address(&self) -> &str {
        &self.address
    }
    /// Queues a lock request on behalf of `requester`; the answer is later
    /// collected with `lock_status` under the same requester.
    pub async fn lock_file(&self, requester: &str, file_name: &str) -> Result<(), RemoteError> {
        let request = DataPacket::request("lock_file")
            .with("requester", requester)
            .with("file_name", file_name);
        self.pool.call(&self.address, &request).await?;
        Ok(())
    }
    pub async fn unlock_file(&self, file_name: &str) -> Result<(), RemoteError> {
        let request = DataPacket::request("unlock_file").with("file_name", file_name);
        self.pool.call(&self.address, &request).await?;
        Ok(())
    }
    /// Outcome of the oldest uncollected lock request `requester` made on
    /// `file_name`.
    pub async fn lock_status(&self, requester: &str, file_name: &str) -> Result<LockState, RemoteError> {
        let request = DataPacket::request("lock_status")
            .with("requester", requester)
            .with("file_name", file_name);
        let reply = self.pool.call(&self.address, &request).await?;
        reply.get("lock")?.parse()
    }
}

#[async_trait]
impl PeerHandle for RemotePeer {
    #[instrument(name = "service_peer_request_download", skip(self, requester), fields(peer = %self.address))]
    async fn request_download(&self, requester: &NodeInfo, file_name: &str) -> Result<(), RemoteError> {
        let request = DataPacket::request("request_download")
            .with("requester", requester.address())
            .with("file_name", file_name);
        self.pool.call(&self.address, &request).await?;
        trace!("download request accepted");
        Ok(())
    }
    #[instrument(name = "service_peer_set_owner_file", skip(self, file_info), fields(peer = %self.address, file_name = %file_info.file_name))]
    async fn set_owner_file(&self, file_info: &FileInfo) -> Result<(), RemoteError> {
        let encoded =
            serde_json::to_string(file_info).map_err(|e| RemoteError::Protocol(e.to_string()))?;
        let request = DataPacket::request("set_owner_file").with("file_info", encoded);
        self.pool.call(&self.address, &request).await?;
        Ok(())
    }
}
