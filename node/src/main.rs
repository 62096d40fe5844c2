use std::sync::Arc;

use node::{
    config::Config,
    file_watch::FileWatch,
    lock_coordinator::LockCoordinator,
    membership::Membership,
    nameserver::service::NameserverService,
    ownership::OwnershipManager,
    peer::{
        handler::{PeerHandler, PeerServer},
        service::PeerService,
    },
    transfer::TransferService,
};
use storage::file_storage::FileStorage;
use tokio::{
    sync::{Mutex, watch},
    time::interval,
};
use utilities::{
    discovery::{Announcement, Discovery},
    event_queue::EventQueue,
    logger::{error, info, init_logger, warn},
    result::Result,
    ring::{NodeInfo, Ring},
    tcp_pool::TcpPool,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    let _gaurd = init_logger(
        "Node",
        &config.node_name,
        &config.log_level,
        &config.log_base,
        config.apm_endpoint.as_deref(),
    )?;
    info!(path = %config.storage_path.display(), "Opening storage");
    let store = match FileStorage::new(&config.storage_path) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Error while opening the storage Hence shuting down");
            return Err(e);
        }
    };
    let advertised_port = config.advertised_port().ok_or("advertise_addr has no port")?;
    let self_id = NodeInfo::new(&config.node_name, config.advertise_addr.clone());
    info!(address = %self_id.address(), position = self_id.hash(), "Node identity");
    let pool = TcpPool::new(config.remote_timeout());

    let nameserver = Arc::new(NameserverService::new(config.nameserver_addr.clone(), pool.clone()));
    if let Err(e) = nameserver
        .register_node(&config.node_name, self_id.address())
        .await
    {
        warn!(error = %e, "Could not register with the nameserver, relying on discovery");
    }

    let manager = match OwnershipManager::new(
        self_id.clone(),
        FileWatch::new(store.clone()),
        nameserver.clone(),
        Arc::new(PeerService::new(pool.clone())),
    )
    .await
    {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!(error = %e, "Error while scanning local files Hence shuting down");
            return Err(e);
        }
    };
    let locks = Arc::new(LockCoordinator::new(FileWatch::new(store.clone())));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = vec![];

    let downloads = EventQueue::new();
    let transfer = TransferService::new(store.clone(), pool.clone(), config.transfer_timeout());
    handles.push(transfer.spawn_listener(&downloads));

    let peer_handler = PeerHandler::new(store.clone(), manager.clone(), locks.clone(), downloads.clone());
    let peer_server = PeerServer::bind(&config.listen_addr, peer_handler, config.remote_timeout()).await?;
    let server_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = peer_server.serve(server_shutdown).await {
            error!(error = %e, "Peer server stopped");
        }
    }));

    let mut ring = Ring::new();
    ring.insert(self_id.clone());
    let ring = Arc::new(Mutex::new(ring));
    let peers = EventQueue::new();
    handles.push(Membership::new(config.node_name.clone(), ring.clone(), manager.clone()).spawn(&peers));
    match Discovery::join(config.discovery.group, config.discovery.port).await {
        Ok(discovery) => {
            let discovery = Arc::new(discovery);
            // the receive loop ends with its socket, shutdown does not wait for it
            discovery.listen(peers.clone());
            let announcement = Announcement {
                name: config.node_name.clone(),
                port: advertised_port,
            };
            let mut announce_shutdown = shutdown_rx.clone();
            let period = config.announce_interval();
            handles.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = announce_shutdown.changed() => break,
                    }
                    if discovery.is_finished() {
                        warn!("Discovery listener finished, stopping announcements");
                        break;
                    }
                    if let Err(e) = discovery.announce(&announcement).await {
                        warn!(error = %e, "Announcement failed");
                    }
                }
            }));
        }
        Err(e) => {
            error!(error = %e, "Could not join the discovery group, running without peers");
        }
    }

    let prev = ring
        .lock()
        .await
        .predecessor(&self_id)
        .cloned()
        .unwrap_or_else(|| self_id.clone());
    manager.startup_replication(&prev).await;
    handles.push(manager.clone().start(
        ring.clone(),
        config.replication_interval(),
        shutdown_rx.clone(),
    ));
    handles.push(locks.clone().start(config.lock_poll_interval(), shutdown_rx.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown_tx.send(true)?;
    peers.close();
    downloads.close();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Task ended abnormally");
        }
    }
    info!("Node stopped");
    Ok(())
}
