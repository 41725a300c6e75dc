//! Single-process assembly of the bus.
//!
//! Wires the file store, KV store, and router together, then parks the
//! calling thread until a termination signal arrives. Connectors and HTTP
//! front-ends are attached by embedding processes through the library API.

use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::config::Config;
use crate::router::{AllowAll, Router};
use crate::store::filestore::FileMessageStore;
use crate::store::MemoryKvStore;
use crate::{Error, Result};

/// Run the daemon in the current process.
///
/// Returns once SIGINT or SIGTERM has been handled and the router has
/// drained and stopped.
pub fn run(config: Config) -> Result<()> {
    let store = FileMessageStore::open(config.data_dir.clone(), config.node_id, config.partition)?;
    let router = Arc::new(Router::new(
        Arc::new(AllowAll),
        Arc::new(store),
        Arc::new(MemoryKvStore::new()),
    ));
    router.check()?;

    let mut signals = Signals::new([SIGTERM, SIGINT]).map_err(Error::Signals)?;
    router.start()?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        node_id = config.node_id,
        "fanout daemon running"
    );

    // Blocks until the process is asked to terminate.
    if let Some(signal) = signals.forever().next() {
        tracing::info!(signal, "terminating on signal");
    }

    router.stop();
    tracing::info!("fanout daemon stopped");
    Ok(())
}
