//! The Coordinator (spec.md §4.6): the single periodic loop that advances
//! every Task through PENDING → POSTED → RETRIEVED → FORWARDED → a terminal
//! state. Structured as a supervisor owning its own ticker and shutdown
//! signal (DESIGN NOTES §9) rather than relying on an external scheduler,
//! the way the teacher's `registerer.rs`/`registration_synchronizer.rs` pair
//! owns its own polling loop.

/// `pub` (rather than private) so integration tests can drive individual
/// phases directly against a real catalog and a real SCP socket, the same
/// way `registration_synchronizer.rs`'s step functions are unit-testable on
/// their own.
pub mod phases;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use crate::catalog::Catalog;
use crate::config::GatewaySettings;
use crate::ids::AeTitle;
use crate::inference_client::InferenceClient;
use crate::scp::association::StudyGroup;

/// Cooperative shutdown signal shared between whoever drives the process
/// lifecycle and the Coordinator's loop. `flag` is checked between phases so
/// a shutdown mid-iteration stops before the next phase; `wake` interrupts
/// the idle sleep between iterations so shutdown doesn't wait out a full
/// `daemon_run_interval`.
pub struct Shutdown {
    flag: AtomicBool,
    wake: Notify,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { flag: AtomicBool::new(false), wake: Notify::new() })
    }

    pub fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct Coordinator {
    catalog: Catalog,
    inference_client: InferenceClient,
    handoff_rx: mpsc::Receiver<StudyGroup>,
    interval: Duration,
    task_timeout: Duration,
    poll_fanout: usize,
    gateway_ae_title: AeTitle,
    shutdown: Arc<Shutdown>,
}

impl Coordinator {
    pub fn new(
        catalog: Catalog,
        inference_client: InferenceClient,
        handoff_rx: mpsc::Receiver<StudyGroup>,
        settings: &GatewaySettings,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            catalog,
            inference_client,
            handoff_rx,
            interval: settings.daemon_run_interval,
            task_timeout: settings.timeout,
            poll_fanout: settings.poll_fanout.get(),
            gateway_ae_title: settings.scp_ae_title.clone(),
            shutdown,
        }
    }

    /// Runs iterations until the shutdown signal fires, finishing whichever
    /// phase is in flight first (spec.md §4.6: "finish its current phase and
    /// stop before the next").
    pub async fn run(mut self) {
        loop {
            self.run_iteration().await;
            if self.shutdown.requested() {
                tracing::info!("coordinator shutting down");
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.shutdown.wake.notified() => {
                    tracing::info!("coordinator shutting down");
                    return;
                }
            }
        }
    }

    async fn run_iteration(&mut self) {
        phases::retire(&self.catalog, self.task_timeout).await;
        if self.shutdown.requested() {
            return;
        }
        phases::fingerprint(&self.catalog, &mut self.handoff_rx, self.interval).await;
        if self.shutdown.requested() {
            return;
        }
        phases::post(&self.catalog, &self.inference_client).await;
        if self.shutdown.requested() {
            return;
        }
        phases::get(&self.catalog, &self.inference_client, self.poll_fanout).await;
        if self.shutdown.requested() {
            return;
        }
        phases::forward(&self.catalog, &self.gateway_ae_title).await;
        if self.shutdown.requested() {
            return;
        }
        phases::cleanup(&self.catalog, &self.inference_client).await;
    }
}
