//! Document change notifications.
//!
//! Every committed put or delete produces a [`DocumentChange`]. Subscribers
//! register a predicate and get a [`Subscription`] stream of the matching
//! changes committed after they subscribed. Dropping the subscription
//! unsubscribes. A subscriber whose buffer fills up is disconnected; its
//! stream ends.
//!
//! Changes to documents whose id starts with `system/` are control-plane
//! changes: the merger raises them before the commit's callers resume.
//! Everything else is raised afterwards, off the commit path.

use futures::Stream;
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Id prefix of control-plane documents.
pub const SYSTEM_PREFIX: &str = "system/";

/// Kind of document change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentChangeKind {
    /// Created or replaced.
    Put,
    /// Removed.
    Delete,
}

/// A committed change to one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    /// Document id as written.
    pub id: String,
    /// Collection from the document metadata, if any.
    pub collection: Option<String>,
    /// Kind of change.
    pub kind: DocumentChangeKind,
}

impl DocumentChange {
    /// A put of `id`.
    pub fn put(id: impl Into<String>, collection: Option<String>) -> Self {
        Self {
            id: id.into(),
            collection,
            kind: DocumentChangeKind::Put,
        }
    }

    /// A delete of `id`.
    pub fn delete(id: impl Into<String>, collection: Option<String>) -> Self {
        Self {
            id: id.into(),
            collection,
            kind: DocumentChangeKind::Delete,
        }
    }

    /// Returns true for control-plane documents.
    #[must_use]
    pub fn is_system_document(&self) -> bool {
        is_system_id(&self.id)
    }
}

/// Returns true if `id` names a control-plane document.
#[must_use]
pub fn is_system_id(id: &str) -> bool {
    id.get(..SYSTEM_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(SYSTEM_PREFIX))
}

type Filter = Box<dyn Fn(&DocumentChange) -> bool + Send + Sync>;

struct Subscriber {
    id: u64,
    filter: Filter,
    sender: mpsc::Sender<DocumentChange>,
}

struct ChangesInner {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
    system_raised: AtomicU64,
    data_raised: AtomicU64,
}

/// The change notifier of one database.
#[derive(Clone)]
pub struct DocumentsChanges {
    inner: Arc<ChangesInner>,
}

impl std::fmt::Debug for DocumentsChanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentsChanges")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl DocumentsChanges {
    /// Creates a notifier buffering up to `buffer` changes per subscriber.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(ChangesInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                system_raised: AtomicU64::new(0),
                data_raised: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribes to changes matching `filter`.
    pub fn subscribe(
        &self,
        filter: impl Fn(&DocumentChange) -> bool + Send + Sync + 'static,
    ) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push(Subscriber {
            id,
            filter: Box::new(filter),
            sender,
        });
        Subscription {
            id,
            receiver,
            changes: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribes to every change.
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(|_| true)
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Returns how many control-plane changes were raised.
    #[must_use]
    pub fn system_notifications_raised(&self) -> u64 {
        self.inner.system_raised.load(Ordering::Relaxed)
    }

    /// Returns how many data-plane changes were raised.
    #[must_use]
    pub fn notifications_raised(&self) -> u64 {
        self.inner.data_raised.load(Ordering::Relaxed)
    }

    /// Delivers a control-plane change. Called on the commit path.
    pub fn raise_system_notification(&self, change: &DocumentChange) {
        self.inner.system_raised.fetch_add(1, Ordering::Relaxed);
        self.emit(change);
    }

    /// Delivers a data-plane change.
    pub fn raise_notification(&self, change: &DocumentChange) {
        self.inner.data_raised.fetch_add(1, Ordering::Relaxed);
        self.emit(change);
    }

    fn emit(&self, change: &DocumentChange) {
        let mut subscribers = self.inner.subscribers.write();
        subscribers.retain(|s| {
            if !(s.filter)(change) {
                return !s.sender.is_closed();
            }
            match s.sender.try_send(change.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = s.id, "change subscriber is too slow, disconnecting");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// A stream of changes. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<DocumentChange>,
    changes: Weak<ChangesInner>,
}

impl Subscription {
    /// Returns a buffered change without waiting.
    pub fn try_next(&mut self) -> Option<DocumentChange> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = DocumentChange;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.changes.upgrade() {
            inner.subscribers.write().retain(|s| s.id != self.id);
        }
    }
}
