use std::{net::SocketAddr, sync::Arc, time::Duration};

use storage::{file_storage::FileStorage, storage::Storage};
use tokio::{
    io::{AsyncWriteExt, copy},
    net::{TcpListener, TcpStream},
    sync::watch,
    time::timeout,
};
use utilities::{
    data_packet::DataPacket,
    event_queue::EventQueue,
    logger::{Instrument, Span, error, info, instrument, trace, tracing},
    result::Result,
    ring::FileInfo,
};

use crate::{lock_coordinator::LockCoordinator, ownership::OwnershipManager, transfer::DownloadRequest};

/// Answers requests from other nodes. Every connection carries one request
/// packet and gets one reply packet, `fetch_file` replies are followed by
/// the file bytes.
pub struct PeerHandler {
    store: FileStorage,
    manager: Arc<OwnershipManager>,
    locks: Arc<LockCoordinator>,
    downloads: EventQueue<DownloadRequest>,
}

impl PeerHandler {
    pub fn new(
        store: FileStorage,
        manager: Arc<OwnershipManager>,
        locks: Arc<LockCoordinator>,
        downloads: EventQueue<DownloadRequest>,
    ) -> Self {
        Self {
            store,
            manager,
            locks,
            downloads,
        }
    }

    async fn handle_connection(&self, mut tcp_stream: TcpStream, request_timeout: Duration) -> Result<()> {
        let request = timeout(request_timeout, DataPacket::decode(&mut tcp_stream))
            .await
            .map_err(|_| "client did not send its request in time")??;
        let op = request.op()?.to_owned();
        trace!(%op, "Got peer request");
        if op == "fetch_file" {
            return self.fetch_file(&request, tcp_stream).await;
        }
        let reply = self
            .dispatch(&op, &request)
            .await
            .unwrap_or_else(|e| DataPacket::error(e.to_string()));
        reply.write_to(&mut tcp_stream).await?;
        Ok(())
    }

    async fn dispatch(&self, op: &str, request: &DataPacket) -> Result<DataPacket> {
        match op {
            "request_download" => self.request_download(request).await,
            "set_owner_file" => self.set_owner_file(request).await,
            "lock_file" => {
                self.locks
                    .request_lock(request.get("file_name")?, request.get("requester")?)
                    .await;
                Ok(DataPacket::ok())
            }
            "unlock_file" => {
                self.locks.request_unlock(request.get("file_name")?).await;
                Ok(DataPacket::ok())
            }
            "lock_status" => {
                let state = self
                    .locks
                    .take_status(request.get("file_name")?, request.get("requester")?)
                    .await;
                Ok(DataPacket::ok().with("lock", state.to_string()))
            }
            other => Err(format!("unknown operation {other:?}").into()),
        }
    }

    #[instrument(name = "handler_peer_request_download", skip_all)]
    async fn request_download(&self, request: &DataPacket) -> Result<DataPacket> {
        let download = DownloadRequest {
            source: request.get("requester")?.to_owned(),
            file_name: request.get("file_name")?.to_owned(),
        };
        info!(source = %download.source, file_name = %download.file_name, "Download requested");
        self.downloads.add(download).await;
        Ok(DataPacket::ok())
    }

    #[instrument(name = "handler_peer_set_owner_file", skip_all)]
    async fn set_owner_file(&self, request: &DataPacket) -> Result<DataPacket> {
        let file_info: FileInfo = serde_json::from_str(request.get("file_info")?)?;
        self.manager.set_owner_file(file_info).await;
        Ok(DataPacket::ok())
    }

    #[instrument(name = "handler_peer_fetch_file", skip_all)]
    async fn fetch_file(&self, request: &DataPacket, mut tcp_stream: TcpStream) -> Result<()> {
        let file_name = request.get("file_name")?.to_owned();
        let file_size = match self.store.get_file_size(&file_name).await {
            Ok(size) => size,
            Err(e) => {
                DataPacket::error(format!("cannot serve {file_name}: {e}"))
                    .write_to(&mut tcp_stream)
                    .await?;
                return Ok(());
            }
        };
        let mut reader = self.store.read(file_name.clone()).await?;
        DataPacket::ok()
            .with("file_size", file_size.to_string())
            .write_to(&mut tcp_stream)
            .await?;
        let sent = copy(&mut reader, &mut tcp_stream).await?;
        tcp_stream.flush().await?;
        trace!(%file_name, sent, "File streamed to peer");
        Ok(())
    }
}

/// TCP listener in front of a `PeerHandler`, one task per connection.
pub struct PeerServer {
    listener: TcpListener,
    handler: Arc<PeerHandler>,
    request_timeout: Duration,
}

impl PeerServer {
    pub async fn bind(address: &str, handler: PeerHandler, request_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
            request_timeout,
        })
    }
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
    /// Accepts connections until `shutdown` flips. A client that has not
    /// sent its request within the request timeout is dropped.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(address = %self.local_addr()?, "Peer server listening");
        loop {
            let (tcp_stream, peer) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = shutdown.changed() => {
                    info!("Peer server stopping");
                    return Ok(());
                }
            };
            let handler = self.handler.clone();
            let request_timeout = self.request_timeout;
            let span = Span::current();
            tokio::spawn(
                async move {
                    if let Err(e) = handler.handle_connection(tcp_stream, request_timeout).await {
                        error!(%peer, error = %e, "error while handling the tcp connection");
                    }
                }
                .instrument(span),
            );
        }
    }
}
