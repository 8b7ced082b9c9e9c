// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Queue primitives shared by the protocol tasks: an awaitable FIFO,
//! a bounded in-flight store keyed by packet id, and a cancel token.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use codec::PacketId;
use tokio::sync::{watch, Notify};

use crate::error::{Error, ErrorKind};

/// Clonable cancellation signal.
///
/// Every clone observes the same state; once canceled, a token stays
/// canceled.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Fire the signal and wake all waiters.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the signal fires.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            // A sender handle is held by every clone of this token,
            // so the channel cannot close while we wait on it.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Awaitable FIFO of items.
///
/// `push` never blocks; `pop` suspends until an item arrives or the cancel
/// token fires. Single consumer.
pub struct PacketQueue<T> {
    inner: Arc<QueueInner<T>>,
}

struct QueueInner<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Clone for PacketQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for PacketQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PacketQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                items: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Append an item and wake the consumer.
    pub fn push(&self, item: T) {
        self.inner.items.lock().unwrap().push_back(item);
        self.inner.notify.notify_one();
    }

    /// Take the oldest item, waiting until one arrives.
    ///
    /// # Errors
    ///
    /// Returns `Canceled` if `cancel` fires while waiting.
    pub async fn pop(&self, cancel: &CancelToken) -> Result<T, Error> {
        loop {
            // Register for wakeup before checking, so a push in between
            // is not lost.
            let notified = self.inner.notify.notified();
            if let Some(item) = self.inner.items.lock().unwrap().pop_front() {
                return Ok(item);
            }
            tokio::select! {
                () = notified => {}
                () = cancel.cancelled() => {
                    return Err(Error::new(ErrorKind::Canceled, "queue pop canceled"));
                }
            }
        }
    }

    /// Drop all items atomically.
    pub fn clear(&self) {
        self.inner.items.lock().unwrap().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.items.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().unwrap().is_empty()
    }
}

/// Bounded associative store of in-flight records keyed by packet id.
///
/// The store owns packet id assignment: identifiers are probed starting from
/// a wrapping counter, skipping zero and every id currently in flight or
/// reserved. Insertion blocks while the store is at capacity, which is how
/// the server's Receive Maximum back-pressures publishers.
pub struct InFlightWindow<V> {
    inner: Arc<WindowInner<V>>,
}

struct WindowInner<V> {
    state: Mutex<WindowState<V>>,
    released: Notify,
}

struct WindowState<V> {
    records: HashMap<u16, V>,
    /// Identifiers handed out for subscribe/unsubscribe exchanges.
    reserved: HashSet<u16>,
    capacity: usize,
    next_id: u16,
}

impl<V> Clone for InFlightWindow<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> InFlightWindow<V> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(WindowInner {
                state: Mutex::new(WindowState {
                    records: HashMap::new(),
                    reserved: HashSet::new(),
                    capacity: capacity.max(1),
                    next_id: 1,
                }),
                released: Notify::new(),
            }),
        }
    }

    /// Update capacity, usually to the Receive Maximum advertised in
    /// CONNACK. Lowering the capacity does not evict existing records;
    /// it only delays new insertions.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.inner.state.lock().unwrap();
        state.capacity = capacity.max(1);
        drop(state);
        // A larger window may unblock waiters.
        self.inner.released.notify_waiters();
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.state.lock().unwrap().capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().unwrap().records.is_empty()
    }

    #[must_use]
    pub fn contains(&self, packet_id: PacketId) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .records
            .contains_key(&packet_id.value())
    }

    /// Insert `record` under a freshly assigned packet id, waiting for a
    /// free slot while the window is full.
    ///
    /// # Errors
    ///
    /// Returns `Canceled` if `cancel` fires while waiting, `QuotaExceeded`
    /// if no free identifier exists.
    pub async fn acquire(&self, record: V, cancel: &CancelToken) -> Result<PacketId, Error> {
        let mut pending = Some(record);
        loop {
            let released = self.inner.released.notified();
            {
                let mut state = self.inner.state.lock().unwrap();
                if state.records.len() < state.capacity {
                    let id = state.assign_id()?;
                    if let Some(record) = pending.take() {
                        state.records.insert(id, record);
                    }
                    return Ok(PacketId::new(id));
                }
            }
            tokio::select! {
                () = released => {}
                () = cancel.cancelled() => {
                    return Err(Error::new(ErrorKind::Canceled, "window acquire canceled"));
                }
            }
        }
    }

    /// Remove the record of `packet_id` and wake one waiter.
    pub fn remove(&self, packet_id: PacketId) -> Option<V> {
        let removed = self
            .inner
            .state
            .lock()
            .unwrap()
            .records
            .remove(&packet_id.value());
        if removed.is_some() {
            self.inner.released.notify_one();
        }
        removed
    }

    /// Run `f` on the record of `packet_id`, if present.
    pub fn update<R>(&self, packet_id: PacketId, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.inner
            .state
            .lock()
            .unwrap()
            .records
            .get_mut(&packet_id.value())
            .map(f)
    }

    /// Remove every record, waking all waiters.
    pub fn drain(&self) -> Vec<(PacketId, V)> {
        let mut state = self.inner.state.lock().unwrap();
        let drained = state
            .records
            .drain()
            .map(|(id, record)| (PacketId::new(id), record))
            .collect();
        drop(state);
        self.inner.released.notify_waiters();
        drained
    }

    /// Reserve an unused identifier for a subscribe or unsubscribe exchange.
    ///
    /// Reserved ids are excluded from publish assignment but do not count
    /// against the window capacity.
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded` if no free identifier exists.
    pub fn reserve_id(&self) -> Result<PacketId, Error> {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.assign_id()?;
        state.reserved.insert(id);
        Ok(PacketId::new(id))
    }

    /// Release an identifier taken with [`InFlightWindow::reserve_id`].
    pub fn release_id(&self, packet_id: PacketId) {
        self.inner
            .state
            .lock()
            .unwrap()
            .reserved
            .remove(&packet_id.value());
    }
}

impl<V: Clone> InFlightWindow<V> {
    /// Clone all records, for re-sending after a session resume.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(PacketId, V)> {
        self.inner
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .map(|(id, record)| (PacketId::new(*id), record.clone()))
            .collect()
    }
}

impl<V> WindowState<V> {
    /// Probe for an unused, nonzero packet identifier.
    fn assign_id(&mut self) -> Result<u16, Error> {
        for _ in 0..=u16::MAX {
            let id = self.next_id;
            self.next_id = if self.next_id == u16::MAX {
                1
            } else {
                self.next_id + 1
            };
            if id != 0 && !self.records.contains_key(&id) && !self.reserved.contains(&id) {
                return Ok(id);
            }
        }
        Err(Error::new(
            ErrorKind::QuotaExceeded,
            "no free packet identifier",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_packet_queue_fifo() {
        let queue = PacketQueue::new();
        let cancel = CancelToken::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(&cancel).await.unwrap(), 1);
        assert_eq!(queue.pop(&cancel).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_packet_queue_wakes_consumer() {
        let queue = PacketQueue::new();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let cancel = CancelToken::new();
                queue.pop(&cancel).await.unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(7_u32);
        assert_eq!(consumer.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_packet_queue_pop_canceled() {
        let queue: PacketQueue<u32> = PacketQueue::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = queue.pop(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[tokio::test]
    async fn test_window_assigns_unique_nonzero_ids() {
        let window = InFlightWindow::new(8);
        let cancel = CancelToken::new();
        let mut seen = HashSet::new();
        for i in 0..8 {
            let id = window.acquire(i, &cancel).await.unwrap();
            assert_ne!(id.value(), 0);
            assert!(seen.insert(id.value()));
        }
    }

    #[tokio::test]
    async fn test_window_blocks_at_capacity() {
        let window = InFlightWindow::new(2);
        let cancel = CancelToken::new();
        let id1 = window.acquire("a", &cancel).await.unwrap();
        let _id2 = window.acquire("b", &cancel).await.unwrap();

        let blocked = {
            let window = window.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { window.acquire("c", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert!(window.remove(id1).is_some());
        let id3 = blocked.await.unwrap().unwrap();
        assert_ne!(id3.value(), 0);
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn test_window_acquire_canceled() {
        let window = InFlightWindow::new(1);
        let cancel = CancelToken::new();
        let _id = window.acquire("a", &cancel).await.unwrap();

        let op_cancel = CancelToken::new();
        op_cancel.cancel();
        let err = window.acquire("b", &op_cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[tokio::test]
    async fn test_window_id_probing_skips_in_flight() {
        let window = InFlightWindow::new(4);
        let cancel = CancelToken::new();
        let id1 = window.acquire("a", &cancel).await.unwrap();
        let id2 = window.acquire("b", &cancel).await.unwrap();
        window.remove(id1);

        // The next assignment continues after the highest handed out id
        // instead of reusing id1 immediately.
        let id3 = window.acquire("c", &cancel).await.unwrap();
        assert_ne!(id3, id2);
        assert_ne!(id3.value(), 0);
    }

    #[tokio::test]
    async fn test_window_reserved_ids_not_reused() {
        let window: InFlightWindow<u32> = InFlightWindow::new(4);
        let cancel = CancelToken::new();
        let reserved = window.reserve_id().unwrap();
        let acquired = window.acquire(1, &cancel).await.unwrap();
        assert_ne!(reserved, acquired);
        window.release_id(reserved);
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_all_clones() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }
}
