//! Decides which files this node is responsible for and triggers the
//! downloads that bring the ring into line after a topology or file change.
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use storage::storage::Result as StorageResult;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
    time::interval,
};
use utilities::{
    error::RemoteError,
    logger::{error, info, instrument, trace, tracing, warn},
    ring::{FileInfo, NodeInfo, Ring, arc_contains, ring_hash},
};

use crate::{file_watch::FileWatch, nameserver::NameResolver, peer::PeerRegistry};

/// Where `replicate` sent a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Replication {
    /// This node is the owner; the predecessor was asked to take a copy.
    ToPredecessor(NodeInfo),
    /// Another node owns the file and was asked to take it.
    ToOwner(NodeInfo),
    /// This node owns the file and knows no other node yet.
    NoPeer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// The file stays with this node.
    Stays,
    /// The new neighbour was asked to download the file.
    HandedOff,
    /// The neighbour should take the file but could not be reached.
    HandoffFailed,
    /// Outside both this node's range and the neighbour's under the current
    /// ring view; left for a later neighbour join to settle.
    Gap,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipDecision {
    pub file_name: String,
    pub hash: u32,
    pub placement: Placement,
}

/// Manager of the local file table and of the files this node owns.
///
/// Remote peers reach `owned_files` only through `set_owner_file`; every
/// table has its own lock so inbound calls and the periodic task interleave.
pub struct OwnershipManager {
    self_id: NodeInfo,
    watch: FileWatch,
    resolver: Arc<dyn NameResolver>,
    peers: Arc<dyn PeerRegistry>,
    // file name -> node currently believed responsible
    local_files: Mutex<HashMap<String, NodeInfo>>,
    // every file ever observed or handed to us, never removed
    known_files: Mutex<HashMap<String, FileInfo>>,
    owned_files: Mutex<Vec<FileInfo>>,
    // local files whose replica has not reached any other node yet
    pending_replication: Mutex<BTreeSet<String>>,
}

impl OwnershipManager {
    /// Seeds the local file table from storage. An unreadable storage
    /// directory is returned to the caller, the node cannot run without it.
    #[instrument(name = "ownership_manager_new", skip_all, fields(self_id = %self_id.address()))]
    pub async fn new(
        self_id: NodeInfo,
        watch: FileWatch,
        resolver: Arc<dyn NameResolver>,
        peers: Arc<dyn PeerRegistry>,
    ) -> StorageResult<Self> {
        let local_files = watch.scan(&self_id).await?;
        let known_files = local_files
            .iter()
            .map(|(file_name, owner)| (file_name.clone(), FileInfo::new(file_name.clone(), owner.clone())))
            .collect();
        info!(files = local_files.len(), "Seeded local file table");
        Ok(Self {
            self_id,
            watch,
            resolver,
            peers,
            local_files: Mutex::new(local_files),
            known_files: Mutex::new(known_files),
            owned_files: Mutex::default(),
            pending_replication: Mutex::default(),
        })
    }

    pub fn self_id(&self) -> &NodeInfo {
        &self.self_id
    }
    pub async fn local_files(&self) -> HashMap<String, NodeInfo> {
        self.local_files.lock().await.clone()
    }
    pub async fn owned_files(&self) -> Vec<FileInfo> {
        self.owned_files.lock().await.clone()
    }
    pub async fn owned_file(&self, file_name: &str) -> Option<FileInfo> {
        self.owned_files
            .lock()
            .await
            .iter()
            .find(|f| f.file_name == file_name)
            .cloned()
    }
    pub async fn known_file(&self, file_name: &str) -> Option<FileInfo> {
        self.known_files.lock().await.get(file_name).cloned()
    }

    /// Replicates every file of the local table. Files that fail, or that
    /// found no peer because the ring is still empty, are kept pending and
    /// retried by every periodic cycle until a replica is out.
    #[instrument(name = "ownership_manager_startup_replication", skip_all, fields(prev = %prev.address()))]
    pub async fn startup_replication(&self, prev: &NodeInfo) {
        let mut file_names: Vec<String> = self.local_files.lock().await.keys().cloned().collect();
        file_names.sort();
        for file_name in file_names {
            match self.replicate(&file_name, prev).await {
                Ok(Replication::NoPeer) => {
                    self.pending_replication.lock().await.insert(file_name);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%file_name, error = %e, "Startup replication failed, retrying next cycle");
                    self.pending_replication.lock().await.insert(file_name);
                }
            }
        }
    }
    pub async fn pending_replication(&self) -> Vec<String> {
        self.pending_replication.lock().await.iter().cloned().collect()
    }

    /// Sends `file_name` to where it belongs: the resolved owner, or the
    /// predecessor when this node is the owner itself. The lookup always
    /// precedes the download request and a failed lookup stops here. When
    /// this node owns the file, the owner is also told it holds a replica.
    #[instrument(name = "ownership_manager_replicate", skip(self, prev), fields(prev = %prev.address()))]
    pub async fn replicate(&self, file_name: &str, prev: &NodeInfo) -> Result<Replication, RemoteError> {
        let location = self.resolver.find_location_file(file_name).await?;
        if location == self.self_id {
            if *prev == self.self_id {
                trace!("owner of the file and alone on the ring");
                return Ok(Replication::NoPeer);
            }
            self.peers
                .lookup(prev.address())
                .request_download(&self.self_id, file_name)
                .await?;
            return Ok(Replication::ToPredecessor(prev.clone()));
        }
        let owner = self.peers.lookup(location.address());
        owner.request_download(&self.self_id, file_name).await?;
        if let Some(file_info) = self.owned_file(file_name).await {
            // the owner appends itself on its side
            if let Err(e) = owner.set_owner_file(&file_info).await {
                warn!(owner = %location.address(), error = %e, "Could not tell owner about its replica");
            }
            self.record_holder(file_name, &location).await;
        }
        Ok(Replication::ToOwner(location))
    }

    /// Re-evaluates every local file against a new next neighbour. Files on
    /// the arc between this node and `next` (clockwise, crossing the top of
    /// the ring when `next` sits below this node) are handed to `next`.
    #[instrument(name = "ownership_manager_recheck", skip_all, fields(next = %next.address(), next_hash = next.hash()))]
    pub async fn recheck_ownership(&self, next: &NodeInfo) -> Vec<OwnershipDecision> {
        let mut file_names: Vec<String> = self.local_files.lock().await.keys().cloned().collect();
        file_names.sort();
        let own_hash = self.self_id.hash();
        let mut decisions = Vec::with_capacity(file_names.len());
        for file_name in file_names {
            let hash = ring_hash(&file_name);
            let placement = if arc_contains(own_hash, next.hash(), hash, true) {
                match self
                    .peers
                    .lookup(next.address())
                    .request_download(&self.self_id, &file_name)
                    .await
                {
                    Ok(()) => {
                        info!(%file_name, hash, "File handed off to new neighbour");
                        self.local_files
                            .lock()
                            .await
                            .insert(file_name.clone(), next.clone());
                        self.record_holder(&file_name, next).await;
                        Placement::HandedOff
                    }
                    Err(e) => {
                        warn!(%file_name, error = %e, "Handoff failed, waiting for next ring change");
                        Placement::HandoffFailed
                    }
                }
            } else if hash <= own_hash || next.hash() < own_hash {
                trace!(%file_name, hash, "File stays");
                Placement::Stays
            } else {
                warn!(%file_name, hash, "File beyond current neighbour range, ring view incomplete");
                Placement::Gap
            };
            decisions.push(OwnershipDecision {
                file_name,
                hash,
                placement,
            });
        }
        decisions
    }

    /// Records that this node now holds a replica of `file_info`. Appends
    /// this node to the owner list even if already listed; the owned list
    /// keeps one entry per file name, refreshed with the new owners.
    #[instrument(name = "ownership_manager_set_owner_file", skip_all, fields(file_name = %file_info.file_name))]
    pub async fn set_owner_file(&self, file_info: FileInfo) {
        let mut file_info = file_info;
        file_info.file_owners.push(self.self_id.clone());
        self.known_files
            .lock()
            .await
            .insert(file_info.file_name.clone(), file_info.clone());
        let mut owned_files = self.owned_files.lock().await;
        match owned_files
            .iter_mut()
            .find(|f| f.file_name == file_info.file_name)
        {
            Some(existing) => *existing = file_info,
            None => owned_files.push(file_info),
        }
    }

    /// Local files that would move to `next` if it became the successor:
    /// those hashing strictly between this node and `next`.
    pub async fn check_if_owner(&self, next: &NodeInfo) -> StorageResult<Vec<String>> {
        let recorded = self.local_files().await;
        let table = self.watch.scan_with(&self.self_id, &recorded).await?;
        let mut files: Vec<String> = table
            .into_keys()
            .filter(|file_name| {
                arc_contains(self.self_id.hash(), next.hash(), ring_hash(file_name), false)
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// One periodic cycle: forget files that disappeared, retry pending
    /// replicas, and replicate files that appeared since the last cycle. A
    /// new file whose replication fails stays out of the table and is
    /// retried next cycle; one that found no peer is tracked as pending.
    #[instrument(name = "ownership_manager_sync", skip_all, fields(prev = %prev.address()))]
    pub async fn sync_local_files(&self, prev: &NodeInfo) -> StorageResult<usize> {
        let snapshot = self.local_files().await;
        let delta = self.watch.scan_changes(&self.self_id, &snapshot).await?;
        if !delta.removed.is_empty() {
            let mut local_files = self.local_files.lock().await;
            let mut pending = self.pending_replication.lock().await;
            for file_name in &delta.removed {
                local_files.remove(file_name);
                pending.remove(file_name);
            }
        }
        let mut replicated = self.retry_pending(prev).await;
        for file_name in delta.changed_files() {
            if snapshot.contains_key(file_name) {
                continue;
            }
            match self.replicate(file_name, prev).await {
                Ok(replication) => {
                    let owner = match replication {
                        Replication::ToOwner(owner) => owner,
                        Replication::ToPredecessor(_) => self.self_id.clone(),
                        Replication::NoPeer => {
                            self.pending_replication
                                .lock()
                                .await
                                .insert(file_name.to_owned());
                            self.self_id.clone()
                        }
                    };
                    self.known_files
                        .lock()
                        .await
                        .entry(file_name.to_owned())
                        .or_insert_with(|| FileInfo::new(file_name, self.self_id.clone()));
                    self.local_files
                        .lock()
                        .await
                        .insert(file_name.to_owned(), owner);
                    replicated += 1;
                }
                Err(e) => {
                    warn!(%file_name, error = %e, "Replication failed, retrying next cycle");
                }
            }
        }
        Ok(replicated)
    }

    /// Runs `sync_local_files` every `period` until `shutdown` flips. The
    /// predecessor is read from `ring` on every cycle.
    pub fn start(
        self: Arc<Self>,
        ring: Arc<Mutex<Ring>>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        info!("Replication task stopping");
                        break;
                    }
                }
                let prev = ring
                    .lock()
                    .await
                    .predecessor(&self.self_id)
                    .cloned()
                    .unwrap_or_else(|| self.self_id.clone());
                match self.sync_local_files(&prev).await {
                    Ok(0) => {}
                    Ok(replicated) => info!(replicated, "Replicated new local files"),
                    Err(e) => error!(error = %e, "Could not scan local files this cycle"),
                }
            }
        })
    }

    // one more attempt for every pending file, returns how many went out
    async fn retry_pending(&self, prev: &NodeInfo) -> usize {
        let pending = self.pending_replication().await;
        let mut replicated = 0;
        for file_name in pending {
            match self.replicate(&file_name, prev).await {
                Ok(Replication::NoPeer) => {
                    trace!(%file_name, "still no peer for pending file");
                }
                Ok(replication) => {
                    if let Replication::ToOwner(owner) = replication {
                        self.local_files.lock().await.insert(file_name.clone(), owner);
                    }
                    self.pending_replication.lock().await.remove(&file_name);
                    info!(%file_name, "Pending replica sent");
                    replicated += 1;
                }
                Err(e) => {
                    warn!(%file_name, error = %e, "Pending replication failed, retrying next cycle");
                }
            }
        }
        replicated
    }

    // remembers that `holder` now has a copy, without touching this node's
    // own entry
    async fn record_holder(&self, file_name: &str, holder: &NodeInfo) {
        {
            let mut known_files = self.known_files.lock().await;
            let info = known_files
                .entry(file_name.to_owned())
                .or_insert_with(|| FileInfo::new(file_name, self.self_id.clone()));
            if !info.is_held_by(holder) {
                info.file_owners.push(holder.clone());
            }
        }
        let mut owned_files = self.owned_files.lock().await;
        if let Some(info) = owned_files.iter_mut().find(|f| f.file_name == file_name) {
            if !info.is_held_by(holder) {
                info.file_owners.push(holder.clone());
            }
        }
    }
}
