use async_trait::async_trait;
use utilities::{
    data_packet::DataPacket,
    error::RemoteError,
    logger::{info, instrument, tracing},
    ring::NodeInfo,
    tcp_pool::TcpPool,
};

use super::NameResolver;

/// Client side of the nameserver.
#[derive(Clone, Debug)]
pub struct NameserverService {
    address: String,
    pool: TcpPool,
}

impl NameserverService {
    pub fn new(address: impl Into<String>, pool: TcpPool) -> Self {
        Self {
            address: address.into(),
            pool,
        }
    }
    #[instrument(name = "service_nameserver_register_node", skip(self))]
    pub async fn register_node(&self, name: &str, address: &str) -> Result<(), RemoteError> {
        let request = DataPacket::request("register_node")
            .with("name", name)
            .with("address", address);
        self.pool.call(&self.address, &request).await?;
        info!("Registered with nameserver");
        Ok(())
    }
}

#[async_trait]
impl NameResolver for NameserverService {
    #[instrument(name = "service_nameserver_find_location_file", skip(self))]
    async fn find_location_file(&self, file_name: &str) -> Result<NodeInfo, RemoteError> {
        let request = DataPacket::request("find_location_file").with("file_name", file_name);
        let reply = self.pool.call(&self.address, &request).await?;
        let hash = reply
            .get("hash")?
            .parse()
            .map_err(|e| RemoteError::Protocol(format!("invalid hash in location reply: {e}")))?;
        Ok(NodeInfo::with_hash(reply.get("address")?, hash))
    }
}
