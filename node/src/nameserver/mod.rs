pub mod service;

use async_trait::async_trait;
use utilities::{error::RemoteError, ring::NodeInfo};

/// Name-resolution collaborator: tells which node currently answers for a
/// file. The location carries the node's ring position with its address.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn find_location_file(&self, file_name: &str) -> Result<NodeInfo, RemoteError>;
}
