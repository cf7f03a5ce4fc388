//! Document-level view of a storage write transaction.
//!
//! [`DocumentsTransaction`] stores JSON documents in the `docs` table, keeps
//! the expiration index in step with them, and buffers the change
//! notifications of everything it writes. Notifications are handed back at
//! commit as [`PendingNotifications`] and must only be dispatched once the
//! commit is durable.

use crate::changes::{DocumentChange, DocumentsChanges};
use crate::error::{ServerError, ServerResult};
use crate::expiration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tenantdb_storage::{AsyncCommit, Environment, WriteTransaction};
use tokio::runtime::Handle;

/// Table holding documents, keyed by lower-cased id.
pub const DOCUMENTS_TABLE: &str = "docs";

/// Metadata object key inside a document.
pub const METADATA: &str = "@metadata";
/// Collection name inside the metadata.
pub const COLLECTION: &str = "@collection";

/// A stored JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Id as first written.
    pub id: String,
    /// Document body, metadata included.
    pub data: Value,
}

impl Document {
    /// Returns `@metadata.@collection`, if present.
    #[must_use]
    pub fn collection(&self) -> Option<String> {
        collection_of(&self.data)
    }

    pub(crate) fn decode(bytes: &[u8]) -> ServerResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ServerError::command(format!("corrupt document: {e}")))
    }

    fn encode(&self) -> ServerResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ServerError::command(e.to_string()))
    }
}

pub(crate) fn collection_of(data: &Value) -> Option<String> {
    data.get(METADATA)?
        .get(COLLECTION)?
        .as_str()
        .map(str::to_string)
}

/// Reads a committed document.
pub(crate) fn read_committed(env: &Environment, id: &str) -> ServerResult<Option<Document>> {
    env.get(DOCUMENTS_TABLE, &id.to_lowercase())
        .map(|bytes| Document::decode(&bytes))
        .transpose()
}

/// Notifications buffered by a transaction, split by delivery path.
#[derive(Debug, Default)]
pub struct PendingNotifications {
    system: Vec<DocumentChange>,
    data: Vec<DocumentChange>,
}

impl PendingNotifications {
    /// Returns true if there is nothing to deliver.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.system.is_empty() && self.data.is_empty()
    }

    /// Delivers control-plane changes now, in order, then hands data-plane
    /// changes to `runtime` for delivery in order.
    pub fn dispatch(self, changes: &DocumentsChanges, runtime: &Handle) {
        for change in &self.system {
            changes.raise_system_notification(change);
        }
        if self.data.is_empty() {
            return;
        }
        let changes = changes.clone();
        let data = self.data;
        runtime.spawn(async move {
            for change in &data {
                changes.raise_notification(change);
            }
        });
    }
}

/// A write transaction over documents.
#[derive(Debug)]
pub struct DocumentsTransaction {
    inner: WriteTransaction,
    notifications: PendingNotifications,
}

impl DocumentsTransaction {
    /// Wraps a storage write transaction.
    #[must_use]
    pub fn new(inner: WriteTransaction) -> Self {
        Self {
            inner,
            notifications: PendingNotifications::default(),
        }
    }

    /// Returns the underlying storage transaction.
    pub fn storage(&mut self) -> &mut WriteTransaction {
        &mut self.inner
    }

    /// Reads a document as this transaction sees it.
    ///
    /// # Errors
    ///
    /// Fails if the stored bytes are not a document.
    pub fn get_document(&self, id: &str) -> ServerResult<Option<Document>> {
        self.inner
            .get(DOCUMENTS_TABLE, &id.to_lowercase())
            .map(|bytes| Document::decode(&bytes))
            .transpose()
    }

    /// Creates or replaces a document.
    ///
    /// A document carrying `@metadata.@expires` is added to the expiration
    /// index; an already past date is accepted.
    ///
    /// # Errors
    ///
    /// Fails for an empty id or an `@expires` value that is not RFC 3339.
    pub fn put_document(&mut self, id: &str, data: Value) -> ServerResult<()> {
        if id.trim().is_empty() {
            return Err(ServerError::command("document id cannot be empty"));
        }
        let lower_id = id.to_lowercase();
        let expires = expiration::expires_at(&data)?;

        let previous = self.get_document(id)?;
        if let Some(previous) = &previous {
            self.unindex_expiration(&lower_id, previous);
        }

        let document = Document {
            id: previous.map_or_else(|| id.to_string(), |p| p.id),
            data,
        };
        self.inner.put(DOCUMENTS_TABLE, &lower_id, document.encode()?);
        if let Some(at) = expires {
            let key = expiration::index_key(at, &lower_id);
            self.inner.put(expiration::EXPIRATION_TABLE, &key, Vec::new());
        }

        let change = DocumentChange::put(document.id.clone(), document.collection());
        self.add_after_commit_notification(change);
        Ok(())
    }

    /// Deletes a document. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Fails if the stored bytes are not a document.
    pub fn delete_document(&mut self, id: &str) -> ServerResult<bool> {
        let lower_id = id.to_lowercase();
        let Some(previous) = self.get_document(id)? else {
            return Ok(false);
        };
        self.unindex_expiration(&lower_id, &previous);
        self.inner.delete(DOCUMENTS_TABLE, &lower_id);
        let change = DocumentChange::delete(previous.id.clone(), previous.collection());
        self.add_after_commit_notification(change);
        Ok(true)
    }

    fn unindex_expiration(&mut self, lower_id: &str, previous: &Document) {
        // An unparsable old value was never indexed.
        if let Ok(Some(at)) = expiration::expires_at(&previous.data) {
            self.inner
                .delete(expiration::EXPIRATION_TABLE, &expiration::index_key(at, lower_id));
        }
    }

    /// Buffers a change to be raised after commit.
    pub fn add_after_commit_notification(&mut self, change: DocumentChange) {
        if change.is_system_document() {
            self.notifications.system.push(change);
        } else {
            self.notifications.data.push(change);
        }
    }

    /// Returns true if a control-plane document was written.
    #[must_use]
    pub fn modified_system_documents(&self) -> bool {
        !self.notifications.system.is_empty()
    }

    /// Returns the number of keys written so far.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.inner.pending_writes()
    }

    /// Queues the durability write and returns the chained transaction.
    pub(crate) fn begin_async_commit_and_start_new(
        self,
    ) -> ServerResult<(AsyncCommit, PendingNotifications, DocumentsTransaction)> {
        let (commit, next) = self.inner.begin_async_commit_and_start_new()?;
        Ok((commit, self.notifications, DocumentsTransaction::new(next)))
    }

    /// Commits synchronously. Returns the published generation and the
    /// notifications to dispatch.
    pub fn commit(self) -> ServerResult<(u64, PendingNotifications)> {
        let generation = self.inner.commit()?;
        Ok((generation, self.notifications))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::DocumentChangeKind;
    use serde_json::json;
    use tenantdb_storage::EnvironmentOptions;

    fn env() -> Environment {
        Environment::open_in_memory(EnvironmentOptions::new("docs").sync_on_commit(false)).unwrap()
    }

    #[test]
    fn put_get_delete() {
        let env = env();
        let mut tx = DocumentsTransaction::new(env.begin_write().unwrap());
        tx.put_document("Users/1", json!({"name": "ada", "@metadata": {"@collection": "Users"}}))
            .unwrap();

        let doc = tx.get_document("users/1").unwrap().unwrap();
        assert_eq!(doc.id, "Users/1");
        assert_eq!(doc.collection().as_deref(), Some("Users"));

        assert!(tx.delete_document("USERS/1").unwrap());
        assert!(!tx.delete_document("users/1").unwrap());
        assert!(tx.get_document("users/1").unwrap().is_none());
    }

    #[test]
    fn notifications_split_by_plane() {
        let env = env();
        let mut tx = DocumentsTransaction::new(env.begin_write().unwrap());
        tx.put_document("system/config", json!({})).unwrap();
        tx.put_document("users/1", json!({})).unwrap();
        tx.put_document("users/2", json!({})).unwrap();
        assert!(tx.modified_system_documents());

        let (generation, pending) = tx.commit().unwrap();
        assert_eq!(generation, 1);
        assert_eq!(pending.system.len(), 1);
        assert_eq!(
            pending.data.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            ["users/1", "users/2"]
        );
        assert!(pending.data.iter().all(|c| c.kind == DocumentChangeKind::Put));
    }

    #[test]
    fn expiration_index_follows_document() {
        let env = env();
        let mut tx = DocumentsTransaction::new(env.begin_write().unwrap());
        tx.put_document("a", json!({"@metadata": {"@expires": "2030-01-01T00:00:00Z"}}))
            .unwrap();
        tx.put_document("a", json!({"@metadata": {"@expires": "2031-01-01T00:00:00Z"}}))
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(env.count(expiration::EXPIRATION_TABLE), 1);

        let mut tx = DocumentsTransaction::new(env.begin_write().unwrap());
        tx.delete_document("a").unwrap();
        tx.commit().unwrap();
        assert_eq!(env.count(expiration::EXPIRATION_TABLE), 0);
    }

    #[test]
    fn invalid_expiration_fails_put() {
        let env = env();
        let mut tx = DocumentsTransaction::new(env.begin_write().unwrap());
        let err = tx
            .put_document("a", json!({"@metadata": {"@expires": "tomorrow"}}))
            .unwrap_err();
        assert!(matches!(err, ServerError::Command { .. }));
        assert!(tx.put_document("", json!({})).is_err());
    }

    #[tokio::test]
    async fn dispatch_raises_system_changes_inline() {
        let changes = DocumentsChanges::new(16);
        let mut all = changes.subscribe_all();
        let env = env();
        let mut tx = DocumentsTransaction::new(env.begin_write().unwrap());
        tx.put_document("users/1", json!({})).unwrap();
        tx.put_document("system/x", json!({})).unwrap();
        let (_, pending) = tx.commit().unwrap();

        pending.dispatch(&changes, &Handle::current());
        assert_eq!(all.try_next().unwrap().id, "system/x");

        use futures::StreamExt;
        assert_eq!(all.next().await.unwrap().id, "users/1");
    }
}
