//! Write commands executed by the transaction merger.

use crate::documents::DocumentsTransaction;
use crate::error::ServerResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of write work applied inside a merged transaction.
///
/// The merger only sequences commands and captures their errors. A command
/// that fails aborts the batch it ran in, so `execute` may leave partial
/// writes behind; they are discarded with the transaction.
pub trait MergedCommand: Send + 'static {
    /// Applies the command. Returns the number of affected documents.
    ///
    /// # Errors
    ///
    /// Any error aborts the current batch.
    fn execute(&mut self, tx: &mut DocumentsTransaction) -> ServerResult<usize>;
}

impl<F> MergedCommand for F
where
    F: FnMut(&mut DocumentsTransaction) -> ServerResult<usize> + Send + 'static,
{
    fn execute(&mut self, tx: &mut DocumentsTransaction) -> ServerResult<usize> {
        self(tx)
    }
}

/// Creates or replaces one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutDocument {
    /// Document id.
    pub id: String,
    /// Document body.
    pub data: Value,
}

impl PutDocument {
    /// Creates the command.
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self { id: id.into(), data }
    }
}

impl MergedCommand for PutDocument {
    fn execute(&mut self, tx: &mut DocumentsTransaction) -> ServerResult<usize> {
        // Taken, not cloned: a command executes at most once.
        let data = std::mem::take(&mut self.data);
        tx.put_document(&self.id, data)?;
        Ok(1)
    }
}

/// Deletes one document. Deleting a missing document affects nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteDocument {
    /// Document id.
    pub id: String,
}

impl DeleteDocument {
    /// Creates the command.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl MergedCommand for DeleteDocument {
    fn execute(&mut self, tx: &mut DocumentsTransaction) -> ServerResult<usize> {
        Ok(usize::from(tx.delete_document(&self.id)?))
    }
}

/// One operation of a [`BatchCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BatchOperation {
    /// Create or replace.
    Put {
        /// Document id.
        id: String,
        /// Document body.
        data: Value,
    },
    /// Delete.
    Delete {
        /// Document id.
        id: String,
    },
}

/// Several operations applied in order as one command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchCommand {
    /// Operations, applied in order.
    pub operations: Vec<BatchOperation>,
}

impl BatchCommand {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a put.
    #[must_use]
    pub fn put(mut self, id: impl Into<String>, data: Value) -> Self {
        self.operations.push(BatchOperation::Put { id: id.into(), data });
        self
    }

    /// Appends a delete.
    #[must_use]
    pub fn delete(mut self, id: impl Into<String>) -> Self {
        self.operations.push(BatchOperation::Delete { id: id.into() });
        self
    }
}

impl MergedCommand for BatchCommand {
    fn execute(&mut self, tx: &mut DocumentsTransaction) -> ServerResult<usize> {
        let mut affected = 0;
        for op in std::mem::take(&mut self.operations) {
            affected += match op {
                BatchOperation::Put { id, data } => {
                    tx.put_document(&id, data)?;
                    1
                }
                BatchOperation::Delete { id } => usize::from(tx.delete_document(&id)?),
            };
        }
        Ok(affected)
    }
}
