//! Wires the SCP listener and the Coordinator into one running gateway
//! (spec.md §5: "a gateway instance is one SCP listener and one Coordinator
//! loop sharing a catalog"), the same shape as the teacher's
//! `run_everything_from_env.rs`/`run_from_env.rs` pair.

use std::net::SocketAddrV4;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::catalog::Catalog;
use crate::config::GatewaySettings;
use crate::coordinator::{Coordinator, Shutdown};
use crate::inference_client::InferenceClient;
use crate::scp::{self, ScpConfig};

/// The SCP accept loop runs on its own small pool of blocking OS threads,
/// separate from `poll_fanout` (which bounds Phase D's concurrent HTTP
/// polling, an unrelated knob).
const SCP_THREAD_POOL_SIZE: usize = 8;

/// Loads settings from the environment and runs the gateway until
/// `shutdown` fires.
pub async fn run_from_env(shutdown: Arc<Shutdown>) -> anyhow::Result<()> {
    let settings: GatewaySettings = crate::config::get_config().extract()?;
    run(settings, shutdown).await
}

/// Runs one gateway instance to completion: connects the catalog, starts
/// the SCP listener on a blocking thread, and runs the Coordinator on the
/// current task until `shutdown` fires.
pub async fn run(settings: GatewaySettings, shutdown: Arc<Shutdown>) -> anyhow::Result<()> {
    settings.cert_file.validate_for_production()?;

    let catalog = Catalog::connect(settings.db_basedir.clone()).await?;
    let inference_client = InferenceClient::new(&settings.cert_file, settings.timeout, settings.http_retries)?;

    let (handoff_tx, handoff_rx) = mpsc::channel(settings.handoff_queue_capacity.get());

    let scp_config = ScpConfig::from_settings(&settings);
    let scp_address = SocketAddrV4::new(settings.scp_ip, settings.scp_port);
    // The SCP accept loop is synchronous (dicom-ul's server association API
    // blocks on std::net::TcpStream) and only returns if the listener socket
    // itself errors, so it is not awaited here; dropping the main task at
    // shutdown is what actually tears it down.
    let _scp_handle = tokio::task::spawn_blocking(move || {
        if let Err(e) = scp::run(scp_address, scp_config, handoff_tx, SCP_THREAD_POOL_SIZE) {
            tracing::error!(error = %e, "scp listener exited with an error");
        }
    });

    let coordinator = Coordinator::new(catalog, inference_client, handoff_rx, &settings, shutdown);
    coordinator.run().await;

    Ok(())
}
