use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
    time::interval,
};
use utilities::{
    error::RemoteError,
    event_queue::EventQueue,
    logger::{info, instrument, trace, tracing, warn},
};

use crate::file_watch::FileWatch;

/// How long a decided lock answer waits for its requester to collect it.
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq)]
struct LockRequest {
    file_name: String,
    requester: String,
}

/// Answer to one lock request, addressed to whoever asked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockStatus {
    pub file_name: String,
    pub requester: String,
    pub granted: bool,
    pub decided_at: Instant,
}

/// What a requester learns when asking about its lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Granted,
    Denied,
    Pending,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Granted => write!(f, "granted"),
            LockState::Denied => write!(f, "denied"),
            LockState::Pending => write!(f, "pending"),
        }
    }
}

impl FromStr for LockState {
    type Err = RemoteError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "granted" => Ok(LockState::Granted),
            "denied" => Ok(LockState::Denied),
            "pending" => Ok(LockState::Pending),
            other => Err(RemoteError::Protocol(format!("unknown lock state {other:?}"))),
        }
    }
}

/// Owns the file lock map of this node. Requests are queued by anyone and
/// applied in order on each `update`; nothing else writes the map.
///
/// Constructed once at startup and shared through an `Arc`.
pub struct LockCoordinator {
    watch: FileWatch,
    // true = locked
    lock_map: Mutex<HashMap<String, bool>>,
    lock_requests: EventQueue<LockRequest>,
    unlock_requests: EventQueue<String>,
    lock_status: EventQueue<LockStatus>,
    status_ttl: Duration,
}

impl LockCoordinator {
    pub fn new(watch: FileWatch) -> Self {
        Self {
            watch,
            lock_map: Mutex::default(),
            lock_requests: EventQueue::new(),
            unlock_requests: EventQueue::new(),
            lock_status: EventQueue::new(),
            status_ttl: DEFAULT_STATUS_TTL,
        }
    }
    /// Answers not collected within `ttl` are dropped on a later `update`.
    pub fn with_status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }
    pub async fn request_lock(&self, file_name: &str, requester: &str) {
        self.lock_requests
            .add(LockRequest {
                file_name: file_name.to_owned(),
                requester: requester.to_owned(),
            })
            .await;
    }
    pub async fn request_unlock(&self, file_name: &str) {
        self.unlock_requests.add(file_name.to_owned()).await;
    }
    /// Queue of answers to lock requests, in the order they were decided.
    pub fn status_queue(&self) -> EventQueue<LockStatus> {
        self.lock_status.clone()
    }
    /// Consumes the oldest answer for `requester` on `file_name`. `Pending`
    /// when none has been produced yet or it already expired.
    pub async fn take_status(&self, file_name: &str, requester: &str) -> LockState {
        match self
            .lock_status
            .take_first(|status| status.file_name == file_name && status.requester == requester)
            .await
        {
            Some(LockStatus { granted: true, .. }) => LockState::Granted,
            Some(LockStatus { granted: false, .. }) => LockState::Denied,
            None => LockState::Pending,
        }
    }
    pub async fn is_locked(&self, file_name: &str) -> Option<bool> {
        self.lock_map.lock().await.get(file_name).copied()
    }

    /// Merges newly seen files into the map as unlocked, drops expired
    /// answers, applies queued lock then unlock requests, and returns every
    /// tracked file.
    ///
    /// A lock succeeds only on a tracked, unlocked file. Unlocking a file
    /// that is not locked does nothing and reports nothing.
    #[instrument(name = "lock_coordinator_update", skip_all)]
    pub async fn update(&self, current_files: Vec<String>) -> Vec<String> {
        let ttl = self.status_ttl;
        let expired = self
            .lock_status
            .retain(|status| status.decided_at.elapsed() < ttl)
            .await;
        if expired > 0 {
            trace!(expired, "unclaimed lock answers dropped");
        }
        let mut lock_map = self.lock_map.lock().await;
        match self.watch.file_names().await {
            Ok(local_files) => {
                for file_name in local_files {
                    lock_map.entry(file_name).or_insert(false);
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not list local files, keeping previous view");
            }
        }
        for file_name in current_files {
            lock_map.entry(file_name).or_insert(false);
        }

        for LockRequest { file_name, requester } in self.lock_requests.drain().await {
            let granted = match lock_map.get_mut(&file_name) {
                Some(locked) if !*locked => {
                    *locked = true;
                    true
                }
                _ => false,
            };
            trace!(%file_name, %requester, granted, "lock request decided");
            self.lock_status
                .add(LockStatus {
                    file_name,
                    requester,
                    granted,
                    decided_at: Instant::now(),
                })
                .await;
        }
        for file_name in self.unlock_requests.drain().await {
            if let Some(locked) = lock_map.get_mut(&file_name) {
                *locked = false;
            }
        }

        let mut files: Vec<String> = lock_map.keys().cloned().collect();
        files.sort();
        files
    }

    /// Calls `update` every `period`, feeding back the previous result.
    pub fn start(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            let mut files = Vec::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        info!("Lock coordinator stopping");
                        break;
                    }
                }
                files = self.update(files).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::file_storage::FileStorage;

    fn coordinator_with(files: &[&str]) -> (tempfile::TempDir, LockCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        for file in files {
            std::fs::write(dir.path().join(file), b"x").unwrap();
        }
        let watch = FileWatch::new(FileStorage::new(dir.path()).unwrap());
        (dir, LockCoordinator::new(watch))
    }

    #[tokio::test]
    async fn update_tracks_local_and_given_files_unlocked() {
        let (_dir, locks) = coordinator_with(&["a.txt"]);
        let files = locks.update(vec!["remote.txt".to_owned()]).await;
        assert_eq!(files, vec!["a.txt".to_owned(), "remote.txt".to_owned()]);
        assert_eq!(locks.is_locked("a.txt").await, Some(false));
        assert_eq!(locks.is_locked("missing.txt").await, None);
    }

    #[tokio::test]
    async fn second_lock_on_same_file_fails() {
        let (_dir, locks) = coordinator_with(&["a.txt"]);
        locks.update(vec![]).await;
        locks.request_lock("a.txt", "node-a").await;
        locks.request_lock("a.txt", "node-b").await;
        locks.update(vec![]).await;
        // the refused requester asks first and still only sees its own answer
        assert_eq!(locks.take_status("a.txt", "node-b").await, LockState::Denied);
        assert_eq!(locks.take_status("a.txt", "node-a").await, LockState::Granted);
        assert_eq!(locks.take_status("a.txt", "node-a").await, LockState::Pending);
        assert_eq!(locks.is_locked("a.txt").await, Some(true));
    }

    #[tokio::test]
    async fn unlock_releases_and_allows_relock() {
        let (_dir, locks) = coordinator_with(&["a.txt"]);
        locks.request_lock("a.txt", "node-a").await;
        locks.update(vec![]).await;
        locks.request_unlock("a.txt").await;
        locks.update(vec![]).await;
        assert_eq!(locks.is_locked("a.txt").await, Some(false));

        locks.request_lock("a.txt", "node-a").await;
        locks.update(vec![]).await;
        let statuses = locks.status_queue().drain().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.granted));
    }

    #[tokio::test]
    async fn unlocking_an_unlocked_file_is_silent() {
        let (_dir, locks) = coordinator_with(&["a.txt"]);
        locks.request_unlock("a.txt").await;
        locks.update(vec![]).await;
        assert_eq!(locks.is_locked("a.txt").await, Some(false));
        assert!(locks.status_queue().is_empty().await);
    }

    #[tokio::test]
    async fn lock_on_untracked_file_is_denied() {
        let (_dir, locks) = coordinator_with(&[]);
        locks.request_lock("ghost.txt", "node-a").await;
        locks.update(vec![]).await;
        assert_eq!(locks.take_status("ghost.txt", "node-a").await, LockState::Denied);
    }

    #[tokio::test]
    async fn existing_lock_survives_rescan() {
        let (_dir, locks) = coordinator_with(&["a.txt"]);
        locks.request_lock("a.txt", "node-a").await;
        let files = locks.update(vec![]).await;
        locks.update(files).await;
        assert_eq!(locks.is_locked("a.txt").await, Some(true));
    }

    #[tokio::test]
    async fn answer_for_another_requester_stays_queued() {
        let (_dir, locks) = coordinator_with(&["a.txt"]);
        locks.request_lock("a.txt", "node-a").await;
        locks.update(vec![]).await;
        assert_eq!(locks.take_status("a.txt", "node-b").await, LockState::Pending);
        assert_eq!(locks.take_status("a.txt", "node-a").await, LockState::Granted);
    }

    #[tokio::test]
    async fn unclaimed_answers_expire() {
        let (_dir, locks) = coordinator_with(&["a.txt"]);
        let locks = locks.with_status_ttl(Duration::ZERO);
        locks.request_lock("a.txt", "node-a").await;
        locks.update(vec![]).await;
        assert_eq!(locks.status_queue().len().await, 1);
        locks.update(vec![]).await;
        assert!(locks.status_queue().is_empty().await);
        assert_eq!(locks.take_status("a.txt", "node-a").await, LockState::Pending);
        // the lock itself is kept
        assert_eq!(locks.is_locked("a.txt").await, Some(true));
    }

    #[test]
    fn lock_state_parses_its_display() {
        for state in [LockState::Granted, LockState::Denied, LockState::Pending] {
            assert_eq!(state.to_string().parse::<LockState>().unwrap(), state);
        }
        assert!("maybe".parse::<LockState>().is_err());
    }
}
