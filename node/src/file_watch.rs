use std::collections::HashMap;

use storage::{
    file_storage::FileStorage,
    storage::{Result, Storage},
};
use utilities::{
    logger::{instrument, trace, tracing},
    ring::NodeInfo,
};

/// Difference between the storage directory and the last known table.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanDelta {
    /// Files not in the previous table, grouped by the node now recorded as
    /// responsible for them.
    pub changed: HashMap<NodeInfo, Vec<String>>,
    /// Files in the previous table that are gone from disk.
    pub removed: Vec<String>,
}

impl ScanDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
    pub fn changed_files(&self) -> impl Iterator<Item = &str> {
        self.changed.values().flatten().map(String::as_str)
    }
}

/// Reads the node's storage directory and merges it with what is known
/// about each file's owner. No I/O besides the directory listing.
#[derive(Clone, Debug)]
pub struct FileWatch {
    store: FileStorage,
}

impl FileWatch {
    pub fn new(store: FileStorage) -> Self {
        Self { store }
    }
    pub async fn file_names(&self) -> Result<Vec<String>> {
        self.store.available_files().await
    }
    /// Every local file, attributed to `self_id`.
    pub async fn scan(&self, self_id: &NodeInfo) -> Result<HashMap<String, NodeInfo>> {
        self.scan_with(self_id, &HashMap::new()).await
    }
    /// Every local file with its owner taken from `recorded`, falling back to
    /// `self_id` for files without a record.
    pub async fn scan_with(
        &self,
        self_id: &NodeInfo,
        recorded: &HashMap<String, NodeInfo>,
    ) -> Result<HashMap<String, NodeInfo>> {
        Ok(self
            .file_names()
            .await?
            .into_iter()
            .map(|file_name| {
                let owner = recorded
                    .get(&file_name)
                    .cloned()
                    .unwrap_or_else(|| self_id.clone());
                (file_name, owner)
            })
            .collect())
    }
    #[instrument(name = "file_watch_scan_changes", skip_all)]
    pub async fn scan_changes(
        &self,
        self_id: &NodeInfo,
        previous: &HashMap<String, NodeInfo>,
    ) -> Result<ScanDelta> {
        let current = self.scan_with(self_id, previous).await?;
        let mut delta = ScanDelta::default();
        for (file_name, owner) in &current {
            if previous.get(file_name) != Some(owner) {
                delta
                    .changed
                    .entry(owner.clone())
                    .or_default()
                    .push(file_name.clone());
            }
        }
        delta.removed = previous
            .keys()
            .filter(|file_name| !current.contains_key(*file_name))
            .cloned()
            .collect();
        trace!(
            changed = delta.changed_files().count(),
            removed = delta.removed.len(),
            "scan finished"
        );
        Ok(delta)
    }
}
