use std::{collections::BTreeMap, path::PathBuf};

use utilities::{
    logger::{info, instrument, trace, tracing, warn},
    result::Result,
    ring::{NodeInfo, Ring, ring_hash},
};

/// Registered nodes by name, persisted as one JSON object that is read and
/// rewritten whole. The ring view is rebuilt from it.
pub struct NameTable {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    ring: Ring,
}

impl NameTable {
    /// Reads the table at `path`, starting empty when the file does not
    /// exist yet. An unreadable or corrupt file is an error.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries: BTreeMap<String, String> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No name table yet, starting empty");
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        let mut ring = Ring::new();
        for (name, address) in &entries {
            ring.insert(NodeInfo::new(name, address.clone()));
        }
        info!(nodes = entries.len(), "Name table loaded");
        Ok(Self {
            path,
            entries,
            ring,
        })
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn address_of(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Records `name -> address`. The file is only rewritten when the entry
    /// actually changed, and memory follows only once the write succeeded.
    #[instrument(name = "name_table_insert", skip(self))]
    pub async fn insert(&mut self, name: &str, address: &str) -> Result<bool> {
        if self.address_of(name) == Some(address) {
            trace!("entry unchanged");
            return Ok(false);
        }
        let mut entries = self.entries.clone();
        let previous = entries.insert(name.to_owned(), address.to_owned());
        self.persist(&entries).await?;
        self.entries = entries;
        if let Some(previous) = previous {
            self.ring.remove(&previous);
        }
        let node = NodeInfo::new(name, address);
        if let Some(replaced) = self.ring.insert(node.clone()) {
            warn!(replaced = %replaced.address(), position = node.hash(), "Ring position collision, newcomer replaces occupant");
        }
        info!(position = node.hash(), "Node registered");
        Ok(true)
    }

    /// Node answering for `file_name` under the ring owner rule.
    pub fn find_location(&self, file_name: &str) -> Option<NodeInfo> {
        self.ring.owner_of(ring_hash(file_name)).cloned()
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let encoded = serde_json::to_vec_pretty(entries)?;
        tokio::fs::write(&self.path, encoded).await?;
        Ok(())
    }
}
