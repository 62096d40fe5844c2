use std::time::Duration;

use tokio::{net::TcpStream, time::timeout};
use tracing::trace;

use crate::{data_packet::DataPacket, error::RemoteError};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Hands out connections to peers. Every exchange is bounded by `timeout`,
/// an expired call surfaces as `RemoteError::Timeout`.
#[derive(Clone, Debug)]
pub struct TcpPool {
    timeout: Duration,
}

impl Default for TcpPool {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TcpPool {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
    /// Sends `request` and waits for the reply packet. A reply with an error
    /// status is returned as `RemoteError::Rejected`.
    pub async fn call(&self, tcp_address: &str, request: &DataPacket) -> Result<DataPacket, RemoteError> {
        let (reply, _stream) = self.open(tcp_address, request).await?;
        Ok(reply)
    }
    /// Like `call` but keeps the stream open so the caller can read a body
    /// that follows the reply header.
    pub async fn open(
        &self,
        tcp_address: &str,
        request: &DataPacket,
    ) -> Result<(DataPacket, TcpStream), RemoteError> {
        let exchange = async {
            let mut stream = match TcpStream::connect(tcp_address).await {
                Ok(stream) => stream,
                Err(source) => {
                    return Err(RemoteError::Unreachable {
                        address: tcp_address.to_owned(),
                        source,
                    });
                }
            };
            trace!(%tcp_address, "connected, sending request");
            request.write_to(&mut stream).await?;
            let reply = DataPacket::decode(&mut stream).await?.into_result()?;
            Ok((reply, stream))
        };
        match timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout {
                address: tcp_address.to_owned(),
                elapsed: self.timeout,
            }),
        }
    }
}
