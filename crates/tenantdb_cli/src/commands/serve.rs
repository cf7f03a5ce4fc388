//! Serve command implementation.

use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tenantdb_server::{
    FileStorageProvider, Landlord, MemoryTopology, ServerConfig, ServerError, StandaloneNotifier,
    TopologyStore,
};
use tracing::{debug, info, warn};

/// Options of the serve command.
#[derive(Debug)]
pub struct ServeOptions {
    /// Root data directory.
    pub data_dir: PathBuf,
    /// Node tag.
    pub node: String,
    /// Topology file.
    pub topology: PathBuf,
    /// Idle unload threshold in seconds.
    pub idle_secs: Option<u64>,
    /// Admission capacity.
    pub max_concurrent_loads: Option<usize>,
}

/// Runs the serve command.
pub async fn run(options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let topology = Arc::new(MemoryTopology::from_json_file(&options.topology)?);

    let mut config = ServerConfig::new()
        .data_dir(&options.data_dir)
        .node_tag(&options.node);
    if let Some(secs) = options.idle_secs {
        config = config.idle_unload_after(Duration::from_secs(secs));
    }
    if let Some(loads) = options.max_concurrent_loads {
        config = config.max_concurrent_loads(loads);
    }
    let parallelism = config.max_concurrent_loads.max(1);

    let landlord = Landlord::new(
        config,
        topology.clone(),
        Arc::new(StandaloneNotifier),
        Arc::new(FileStorageProvider),
    );
    landlord.start_idle_sweeper();

    let names = topology.database_names()?;
    let loaded = futures::stream::iter(names)
        .map(|name| {
            let landlord = Arc::clone(&landlord);
            async move {
                let result = landlord.get_or_create(&name).await;
                (name, result)
            }
        })
        .buffer_unordered(parallelism)
        .filter_map(|(name, result)| async move {
            match result {
                Ok(_) => Some(name),
                Err(ServerError::NotRelevant { .. }) => {
                    debug!(database = %name, "not hosted on this node");
                    None
                }
                Err(e) => {
                    warn!(database = %name, error = %e, "could not load database");
                    None
                }
            }
        })
        .count()
        .await;

    info!(node = %options.node, loaded, "serving, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    let result = landlord.shutdown().await;
    landlord.wait_deferred().await;
    let stats = landlord.stats().snapshot();
    info!(
        loads = stats.loads,
        load_failures = stats.load_failures,
        unloads = stats.unloads,
        "stopped"
    );
    result?;
    Ok(())
}
