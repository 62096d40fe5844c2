use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
};
use tracing::trace;

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    signal: Notify,
    closed: AtomicBool,
}

/// Unbounded multi-producer queue with a single listener.
///
/// Adding an item raises a "queue became non-empty" signal. Signals raised
/// before the listener wakes up coalesce, so a handler must drain whatever it
/// wants per wake-up; items it leaves behind wait for the next signal.
pub struct EventQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::new()),
                signal: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }
    pub async fn add(&self, item: T) {
        self.inner.items.lock().await.push_back(item);
        self.inner.signal.notify_one();
    }
    pub async fn poll(&self) -> Option<T> {
        self.inner.items.lock().await.pop_front()
    }
    pub async fn drain(&self) -> Vec<T> {
        self.inner.items.lock().await.drain(..).collect()
    }
    /// Removes and returns the oldest item matching `predicate`, leaving the
    /// order of the rest untouched.
    pub async fn take_first(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        let mut items = self.inner.items.lock().await;
        let position = items.iter().position(predicate)?;
        items.remove(position)
    }
    /// Drops every item `keep` rejects. Returns how many were dropped.
    pub async fn retain(&self, keep: impl FnMut(&T) -> bool) -> usize {
        let mut items = self.inner.items.lock().await;
        let before = items.len();
        items.retain(keep);
        before - items.len()
    }
    pub async fn len(&self) -> usize {
        self.inner.items.lock().await.len()
    }
    pub async fn is_empty(&self) -> bool {
        self.inner.items.lock().await.is_empty()
    }
    /// Waits for the next signal. Returns immediately if one was raised
    /// while nobody was waiting.
    pub async fn notified(&self) {
        self.inner.signal.notified().await;
    }
    /// Wakes the listener one last time; it stops once the queue is empty.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.signal.notify_one();
    }
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl<T: Send + 'static> EventQueue<T> {
    /// Registers `handler` as the queue's listener on its own task. The
    /// handler runs once per signal with a handle to the queue.
    pub fn spawn_listener<F, Fut>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(EventQueue<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                queue.notified().await;
                if !queue.is_empty().await {
                    handler(queue.clone()).await;
                }
                if queue.is_closed() && queue.is_empty().await {
                    trace!("event queue closed, listener stopping");
                    break;
                }
            }
        })
    }
}
