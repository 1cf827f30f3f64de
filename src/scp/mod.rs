//! Inbound DICOM SCP (spec.md §4.1). Accepts associations on a dedicated
//! listener thread, dispatches each to a bounded pool of blocking workers,
//! and publishes every completed, non-empty StudyGroup onto the handoff
//! queue the Coordinator drains in Phase B.

pub mod association;
mod thread_pool;
mod wire;

use crate::config::GatewaySettings;
use crate::ids::AeTitle;
use association::StudyGroup;
use camino::Utf8PathBuf;
use std::net::{SocketAddrV4, TcpListener};
use std::sync::Arc;
use thread_pool::ThreadPool;
use tokio::sync::mpsc;

/// Static parameters the SCP needs; distinct from [`GatewaySettings`] so the
/// wire/association modules don't depend on the whole config surface.
pub struct ScpConfig {
    pub ae_title: AeTitle,
    pub max_pdu_length: u32,
    pub storage_root: Utf8PathBuf,
}

impl ScpConfig {
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            ae_title: settings.scp_ae_title.clone(),
            max_pdu_length: settings.scp_max_pdu_length as u32,
            storage_root: settings.temporary_storage.clone(),
        }
    }
}

/// Runs the SCP accept loop to completion (until the listener socket errors).
/// Blocking: call from `tokio::task::spawn_blocking`, never directly on an
/// async task.
pub fn run(
    address: SocketAddrV4,
    config: ScpConfig,
    handoff_tx: mpsc::Sender<StudyGroup>,
    n_threads: usize,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(address)?;
    tracing::info!(%address, "scp listening");
    let mut pool = ThreadPool::new(n_threads);
    let config = Arc::new(config);

    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept incoming connection");
                continue;
            }
        };
        let config = Arc::clone(&config);
        let handoff_tx = handoff_tx.clone();
        pool.execute(move || handle_connection(stream, &config, &handoff_tx));
    }

    pool.shutdown();
    Ok(())
}

fn handle_connection(stream: std::net::TcpStream, config: &ScpConfig, handoff_tx: &mpsc::Sender<StudyGroup>) {
    let peer = stream.peer_addr().ok();
    let association_id = ulid::Ulid::new().to_string();
    tracing::debug!(association_id, ?peer, "association accepted");

    match wire::handle_association(stream, config, association_id.clone()) {
        Ok(Some(study_group)) => {
            // Backpressure (spec.md §4.1): block until the Coordinator has
            // room, so the peer's association release only completes once
            // the handoff is committed.
            if handoff_tx.blocking_send(study_group).is_err() {
                tracing::warn!(association_id, "handoff queue closed, dropping completed study group");
            }
        }
        Ok(None) => tracing::debug!(association_id, "association released with no stored instances"),
        Err(e) => tracing::error!(association_id, error = %e, "association ended with an error"),
    }
}
