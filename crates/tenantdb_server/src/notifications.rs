//! Server-wide database lifecycle notifications.

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::trace;

/// What happened to a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseChangeKind {
    /// It finished loading on this node.
    Load,
    /// It was removed from this node.
    Delete,
}

/// A database lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseChanged {
    /// Database name.
    pub name: String,
    /// Kind of change.
    pub kind: DatabaseChangeKind,
}

/// Broadcasts [`DatabaseChanged`] events to any number of listeners.
///
/// Listeners that fall behind lose the oldest events.
#[derive(Debug, Clone)]
pub struct ServerNotificationCenter {
    sender: broadcast::Sender<DatabaseChanged>,
}

impl Default for ServerNotificationCenter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ServerNotificationCenter {
    /// Creates a center that buffers `capacity` events per listener.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. Events with no listener are dropped.
    pub fn add(&self, name: impl Into<String>, kind: DatabaseChangeKind) {
        let event = DatabaseChanged {
            name: name.into(),
            kind,
        };
        if self.sender.send(event).is_err() {
            trace!("no listeners for database change");
        }
    }

    /// Subscribes to every event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DatabaseChanged> {
        self.sender.subscribe()
    }

    /// Streams the names of databases as they finish loading.
    #[must_use]
    pub fn on_database_loaded(&self) -> BoxStream<'static, String> {
        stream::unfold(self.subscribe(), |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(DatabaseChanged {
                        name,
                        kind: DatabaseChangeKind::Load,
                    }) => return Some((name, receiver)),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
