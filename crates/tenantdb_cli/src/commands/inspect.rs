//! Inspect command implementation.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tenantdb_server::DatabaseName;
use tenantdb_storage::{journal, DatabaseDir, FileBackend, StorageBackend};

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database directory.
    pub path: String,
    /// Journal file size in bytes.
    pub journal_size: u64,
    /// Bytes covered by valid records.
    pub valid_size: u64,
    /// Whether invalid bytes follow the last valid record.
    pub torn_tail: bool,
    /// Number of valid records.
    pub record_count: usize,
    /// Generation of the last valid record.
    pub generation: u64,
    /// Live keys per table after replay.
    pub tables: Vec<TableStats>,
}

/// Statistics for a single table.
#[derive(Debug, Serialize)]
pub struct TableStats {
    /// Table name.
    pub name: String,
    /// Number of live keys.
    pub keys: usize,
    /// Total value size in bytes.
    pub data_size: usize,
}

/// Runs the inspect command.
pub fn run(
    data_dir: &Path,
    database: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let name = DatabaseName::new(database)?;
    let path = data_dir.join(name.key());
    let result = analyze(&path)?;

    // Output
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(name.as_str(), &result);
        }
    }

    Ok(())
}

/// Replays the journal under `path`.
///
/// Takes the directory lock, so a database loaded by a running server
/// cannot be inspected.
pub fn analyze(path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    if !DatabaseDir::exists(path) {
        return Err(format!("No database found at {:?}", path).into());
    }
    let dir = DatabaseDir::open(path)?;
    let backend = FileBackend::open(&dir.journal_path())?;
    let scan = journal::scan(&backend)?;

    let mut live: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
    for record in &scan.records {
        for write in &record.writes {
            let table = live.entry(write.table.clone()).or_default();
            match &write.value {
                Some(value) => {
                    table.insert(write.key.clone(), value.len());
                }
                None => {
                    table.remove(&write.key);
                }
            }
        }
    }

    let tables = live
        .into_iter()
        .map(|(name, keys)| TableStats {
            name,
            keys: keys.len(),
            data_size: keys.values().sum(),
        })
        .collect();

    Ok(InspectResult {
        path: path.display().to_string(),
        journal_size: backend.size()?,
        valid_size: scan.valid_len,
        torn_tail: scan.torn_tail,
        record_count: scan.records.len(),
        generation: scan.records.last().map_or(0, |r| r.generation),
        tables,
    })
}

fn print_text_output(name: &str, result: &InspectResult) {
    println!("Database: {}", name);
    println!("Path: {}", result.path);
    println!();
    println!("Journal:");
    println!("  Size: {} bytes", result.journal_size);
    println!("  Records: {}", result.record_count);
    println!("  Generation: {}", result.generation);
    if result.torn_tail {
        println!(
            "  Torn tail: {} bytes past the last valid record",
            result.journal_size - result.valid_size
        );
    }

    println!();
    println!("Tables:");
    if result.tables.is_empty() {
        println!("  (none)");
    }
    for table in &result.tables {
        println!("  {}: {} keys, {} bytes", table.name, table.keys, table.data_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantdb_storage::{Environment, EnvironmentOptions};

    #[test]
    fn replays_committed_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("orders");
        let options = EnvironmentOptions::new("orders").sync_on_commit(false);
        let env = Environment::open_dir(&path, options).unwrap();
        let mut tx = env.begin_write().unwrap();
        tx.put("docs", "a", b"12".to_vec());
        tx.put("docs", "b", b"3".to_vec());
        tx.commit().unwrap();
        let mut tx = env.begin_write().unwrap();
        tx.delete("docs", "a");
        tx.put("expires", "k", Vec::new());
        tx.commit().unwrap();
        env.close().unwrap();
        drop(env);

        let result = analyze(&path).unwrap();
        assert_eq!(result.record_count, 2);
        assert_eq!(result.generation, 2);
        assert!(!result.torn_tail);
        assert_eq!(result.valid_size, result.journal_size);
        let docs = result.tables.iter().find(|t| t.name == "docs").unwrap();
        assert_eq!((docs.keys, docs.data_size), (1, 1));
        assert_eq!(result.tables.len(), 2);
    }

    #[test]
    fn missing_database_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(analyze(&tmp.path().join("nothing")).is_err());
    }
}
