pub mod framing;
pub mod handlers;
pub mod protocol;
pub mod server;

pub use server::{Daemon, DaemonState};

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::models::ModelFactory;

/// Start the daemon and serve until shutdown.
pub async fn run(config: Config, factory: Arc<dyn ModelFactory>) -> Result<()> {
    let daemon = Daemon::start(config, factory).await?;
    daemon.run_until_shutdown().await
}
