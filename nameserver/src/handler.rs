use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, watch},
    time::timeout,
};
use utilities::{
    data_packet::DataPacket,
    logger::{Instrument, Span, error, info, instrument, trace, tracing},
    result::Result,
};

use crate::name_table::NameTable;

/// Answers location lookups and registrations from nodes, one request per
/// connection.
pub struct NameserverHandler {
    table: Arc<Mutex<NameTable>>,
}

impl NameserverHandler {
    pub fn new(table: Arc<Mutex<NameTable>>) -> Self {
        Self { table }
    }

    async fn handle_connection(&self, mut tcp_stream: TcpStream) -> Result<()> {
        let request = DataPacket::decode(&mut tcp_stream).await?;
        let reply = self
            .dispatch(&request)
            .await
            .unwrap_or_else(|e| DataPacket::error(e.to_string()));
        reply.write_to(&mut tcp_stream).await?;
        Ok(())
    }

    async fn dispatch(&self, request: &DataPacket) -> Result<DataPacket> {
        match request.op()? {
            "find_location_file" => self.find_location_file(request.get("file_name")?).await,
            "register_node" => {
                self.register_node(request.get("name")?, request.get("address")?)
                    .await
            }
            other => Err(format!("unknown operation {other:?}").into()),
        }
    }

    #[instrument(name = "handler_nameserver_find_location_file", skip(self))]
    async fn find_location_file(&self, file_name: &str) -> Result<DataPacket> {
        let location = self
            .table
            .lock()
            .await
            .find_location(file_name)
            .ok_or("no nodes registered")?;
        trace!(address = %location.address(), hash = location.hash(), "Location found");
        Ok(DataPacket::ok()
            .with("address", location.address())
            .with("hash", location.hash().to_string()))
    }

    #[instrument(name = "handler_nameserver_register_node", skip(self))]
    pub async fn register_node(&self, name: &str, address: &str) -> Result<DataPacket> {
        self.table.lock().await.insert(name, address).await?;
        Ok(DataPacket::ok())
    }
}

pub struct NameserverServer {
    listener: TcpListener,
    handler: Arc<NameserverHandler>,
    request_timeout: Duration,
}

impl NameserverServer {
    pub async fn bind(
        address: &str,
        handler: Arc<NameserverHandler>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            handler,
            request_timeout,
        })
    }
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
    /// Accepts connections until `shutdown` flips. A client that does not
    /// finish its exchange within the request timeout is dropped.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(address = %self.local_addr()?, "Nameserver listening");
        loop {
            let (tcp_stream, peer) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = shutdown.changed() => {
                    info!("Nameserver stopping");
                    return Ok(());
                }
            };
            let handler = self.handler.clone();
            let request_timeout = self.request_timeout;
            let span = Span::current();
            tokio::spawn(
                async move {
                    match timeout(request_timeout, handler.handle_connection(tcp_stream)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(%peer, error = %e, "error while handling the tcp connection");
                        }
                        Err(_) => {
                            error!(%peer, "client did not finish its request in time");
                        }
                    }
                }
                .instrument(span),
            );
        }
    }
}
