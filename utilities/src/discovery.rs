//! Best-effort multicast announcements so nodes learn each other's name and
//! address without prior configuration.
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use tokio::{net::UdpSocket, task::JoinHandle};
use tracing::{error, info, instrument, trace};

use crate::{error::RemoteError, event_queue::EventQueue};

pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(234, 5, 6, 7);
pub const DEFAULT_PORT: u16 = 6789;
/// Datagrams longer than this are dropped.
pub const MAX_ANNOUNCEMENT_SIZE: usize = 2048;

/// Payload of one announcement. The sender's address is taken from the
/// datagram source, only the service port travels in the payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub name: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub name: String,
    pub address: SocketAddr,
}

impl Announcement {
    pub fn encode(&self) -> Result<Vec<u8>, RemoteError> {
        serde_json::to_vec(self).map_err(|e| RemoteError::Protocol(e.to_string()))
    }
    /// `None` for anything that is not a well formed announcement.
    pub fn decode(datagram: &[u8], source: SocketAddr) -> Option<DiscoveredPeer> {
        if datagram.len() > MAX_ANNOUNCEMENT_SIZE {
            return None;
        }
        let announcement: Announcement = serde_json::from_slice(datagram).ok()?;
        if announcement.name.is_empty() {
            return None;
        }
        Some(DiscoveredPeer {
            name: announcement.name,
            address: SocketAddr::new(source.ip(), announcement.port),
        })
    }
}

pub struct Discovery {
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    finished: Arc<AtomicBool>,
}

impl Discovery {
    /// Binds the group port and joins the multicast group on all interfaces.
    pub async fn join(group: Ipv4Addr, port: u16) -> Result<Self, RemoteError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        info!(%group, %port, "Joined discovery group");
        Ok(Self::from_socket(socket, SocketAddrV4::new(group, port)))
    }
    /// Wraps an already bound socket; announcements go to `group`.
    pub fn from_socket(socket: UdpSocket, group: SocketAddrV4) -> Self {
        Self {
            socket: Arc::new(socket),
            group,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }
    /// Sends one announcement to the group. No acknowledgement, no retry.
    #[instrument(name = "discovery_announce", skip(self))]
    pub async fn announce(&self, announcement: &Announcement) -> Result<(), RemoteError> {
        let payload = announcement.encode()?;
        self.socket.send_to(&payload, self.group).await?;
        trace!("announcement sent");
        Ok(())
    }
    /// Receives announcements on a dedicated task and pushes every decoded
    /// peer onto `queue`. A socket error ends the task and marks the
    /// listener finished; it is not restarted, the owner creates a new
    /// `Discovery` instead.
    pub fn listen(&self, queue: EventQueue<DiscoveredPeer>) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let finished = self.finished.clone();
        finished.store(false, Ordering::SeqCst);
        tokio::spawn(async move {
            // one extra byte to tell an oversized datagram from a full one
            let mut buf = vec![0u8; MAX_ANNOUNCEMENT_SIZE + 1];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, source)) => match Announcement::decode(&buf[..len], source) {
                        Some(peer) => {
                            trace!(name = %peer.name, address = %peer.address, "peer announced");
                            queue.add(peer).await;
                        }
                        None => {
                            trace!(%source, %len, "dropping malformed announcement");
                        }
                    },
                    Err(e) => {
                        error!(error = %e, "Discovery socket failed, listener finished");
                        finished.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        })
    }
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}
