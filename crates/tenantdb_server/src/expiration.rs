//! Expired documents cleaner.
//!
//! Documents with an `@metadata.@expires` RFC 3339 timestamp are indexed in
//! the `expires` table under `<unix millis, zero padded>|<lower-cased id>`.
//! The cleaner periodically scans the index up to now, re-checks each
//! document, and deletes the expired ones through the transaction merger.

use crate::background::BackgroundWorker;
use crate::commands::MergedCommand;
use crate::database::DocumentDatabase;
use crate::documents::{self, DocumentsTransaction, METADATA};
use crate::error::{ServerError, ServerResult};
use crate::record::{DatabaseRecord, ExpirationConfig};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Table holding the expiration index.
pub const EXPIRATION_TABLE: &str = "expires";
/// Expiration timestamp inside the metadata.
pub const EXPIRES: &str = "@expires";

/// Reads `@metadata.@expires`.
///
/// # Errors
///
/// Fails if the value is present but is not an RFC 3339 string.
pub fn expires_at(data: &Value) -> ServerResult<Option<DateTime<Utc>>> {
    let Some(value) = data.get(METADATA).and_then(|m| m.get(EXPIRES)) else {
        return Ok(None);
    };
    let invalid = || {
        ServerError::command(format!(
            "the expiration date format is not valid: '{value}'. Use the following format: {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        ))
    };
    let text = value.as_str().ok_or_else(invalid)?;
    DateTime::parse_from_rfc3339(text)
        .map(|date| Some(date.with_timezone(&Utc)))
        .map_err(|_| invalid())
}

fn millis(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_millis()).unwrap_or(0)
}

/// Index key of `lower_id` expiring at `at`.
#[must_use]
pub fn index_key(at: DateTime<Utc>, lower_id: &str) -> String {
    format!("{:020}|{lower_id}", millis(at))
}

fn index_upper_bound(now: DateTime<Utc>) -> String {
    format!("{:020}|", millis(now))
}

fn index_id(key: &str) -> Option<&str> {
    key.split_once('|').map(|(_, id)| id)
}

fn has_expired(data: &Value, now: DateTime<Utc>) -> bool {
    // The user may have changed or removed the date since it was indexed.
    matches!(expires_at(data), Ok(Some(at)) if at <= now)
}

/// Deletes the given index entries and, when still expired, their documents.
#[derive(Debug)]
pub struct DeleteExpiredDocuments {
    entries: Vec<String>,
    now: DateTime<Utc>,
}

impl MergedCommand for DeleteExpiredDocuments {
    fn execute(&mut self, tx: &mut DocumentsTransaction) -> ServerResult<usize> {
        let mut deleted = 0;
        for key in &self.entries {
            let Some(lower_id) = index_id(key) else {
                tx.storage().delete(EXPIRATION_TABLE, key);
                continue;
            };
            match tx.get_document(lower_id)? {
                Some(doc) if has_expired(&doc.data, self.now) => {
                    if tx.delete_document(lower_id)? {
                        deleted += 1;
                    }
                }
                Some(_) => {}
                None => {
                    debug!(id = lower_id, "tried to delete expired document but it was not found");
                }
            }
            tx.storage().delete(EXPIRATION_TABLE, key);
        }
        Ok(deleted)
    }
}

/// Periodically removes expired documents of one database.
#[derive(Debug)]
pub struct ExpiredDocumentsCleaner {
    configuration: ExpirationConfig,
    worker: BackgroundWorker,
}

impl ExpiredDocumentsCleaner {
    /// Reconciles the cleaner with `record`.
    ///
    /// No configuration stops the current cleaner; an unchanged
    /// configuration keeps it; a changed one replaces it unless it is
    /// inactive.
    pub(crate) fn load_configuration(
        database: &Arc<DocumentDatabase>,
        record: &DatabaseRecord,
        current: Option<Arc<Self>>,
    ) -> Option<Arc<Self>> {
        let Some(configuration) = record.expiration.as_ref() else {
            if let Some(current) = current {
                current.stop();
            }
            return None;
        };
        if let Some(current) = current {
            if current.configuration == *configuration {
                return Some(current);
            }
            current.stop();
        }
        if !configuration.active {
            return None;
        }

        let cleaner = Arc::new(Self::new(database, configuration.clone()));
        cleaner.start(Arc::downgrade(database));
        Some(cleaner)
    }

    fn new(database: &DocumentDatabase, configuration: ExpirationConfig) -> Self {
        let period = configuration.period();
        info!(
            database = %database.name(),
            period_secs = period.as_secs(),
            "initialized expired document cleaner"
        );
        Self {
            configuration,
            worker: BackgroundWorker::new(
                format!("expiration-{}", database.name()),
                period,
                database.shutdown_token(),
            ),
        }
    }

    fn start(&self, database: Weak<DocumentDatabase>) {
        self.worker.start(move |cancel| {
            let database = database.clone();
            async move {
                let Some(database) = database.upgrade() else {
                    return Ok(());
                };
                if cancel.is_cancelled() {
                    return Ok(());
                }
                if let Err(e) = Self::cleanup_expired_docs(&database, Utc::now()).await {
                    warn!(
                        database = %database.name(),
                        error = %e,
                        "failed to delete expired documents"
                    );
                }
                Ok(())
            }
        });
    }

    /// Returns the configuration this cleaner runs with.
    #[must_use]
    pub fn configuration(&self) -> &ExpirationConfig {
        &self.configuration
    }

    /// Returns the underlying worker.
    #[must_use]
    pub fn worker(&self) -> &BackgroundWorker {
        &self.worker
    }

    /// Stops the cleaner.
    pub fn stop(&self) {
        self.worker.stop();
    }

    /// Deletes documents of `database` that expired before `now`. Returns
    /// the number deleted.
    ///
    /// # Errors
    ///
    /// Returns the merger's error if the delete command fails.
    pub async fn cleanup_expired_docs(
        database: &DocumentDatabase,
        now: DateTime<Utc>,
    ) -> ServerResult<usize> {
        let env = database.environment();
        let candidates: Vec<String> = env
            .range(EXPIRATION_TABLE, "", &index_upper_bound(now), usize::MAX)
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| {
                index_id(key).map_or(true, |id| match documents::read_committed(env, id) {
                    Ok(Some(doc)) => has_expired(&doc.data, now),
                    Ok(None) | Err(_) => true,
                })
            })
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let started = tokio::time::Instant::now();
        let deleted = database
            .submit(DeleteExpiredDocuments {
                entries: candidates,
                now,
            })
            .await?;
        info!(
            database = %database.name(),
            deleted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "deleted expired documents"
        );
        Ok(deleted)
    }
}
