mod config;
mod handler;
mod name_table;

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use utilities::{
    discovery::{DiscoveredPeer, Discovery},
    event_queue::EventQueue,
    logger::{error, info, init_logger, warn},
    result::Result,
};

use crate::{
    config::Config,
    handler::{NameserverHandler, NameserverServer},
    name_table::NameTable,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    let _gaurd = init_logger(
        "Nameserver",
        &config.id,
        &config.log_level,
        &config.log_base,
        config.apm_endpoint.as_deref(),
    )?;
    info!(path = %config.name_table_file, "Loading the name table");
    let table = match NameTable::load(&config.name_table_file).await {
        Ok(table) => Arc::new(Mutex::new(table)),
        Err(e) => {
            error!(error = %e, "Error while reading the name table Hence shuting down");
            return Err(e);
        }
    };
    let handler = Arc::new(NameserverHandler::new(table.clone()));

    // nodes found through discovery are registered like explicit ones
    let peers: EventQueue<DiscoveredPeer> = EventQueue::new();
    let registrar = handler.clone();
    let membership = peers.spawn_listener(move |queue| {
        let registrar = registrar.clone();
        async move {
            while let Some(peer) = queue.poll().await {
                if let Err(e) = registrar
                    .register_node(&peer.name, &peer.address.to_string())
                    .await
                {
                    error!(name = %peer.name, error = %e, "Could not record discovered node");
                }
            }
        }
    });
    match Discovery::join(config.discovery.group, config.discovery.port).await {
        Ok(discovery) => {
            discovery.listen(peers.clone());
        }
        Err(e) => {
            warn!(error = %e, "Could not join the discovery group, only explicit registrations");
        }
    }

    let server = NameserverServer::bind(&config.listen_addr, handler, config.remote_timeout()).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(server.serve(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown_tx.send(true)?;
    peers.close();
    if let Err(e) = server.await? {
        error!(error = %e, "Nameserver ended with error");
    }
    membership.await?;
    info!(nodes = table.lock().await.len(), "Nameserver stopped");
    Ok(())
}
