use std::sync::Arc;

use inference_gateway::coordinator::Shutdown;

fn main() -> anyhow::Result<()> {
    init_tracing();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let shutdown = Shutdown::new();
        let signal_shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received shutdown signal");
                signal_shutdown.signal();
            }
        });

        inference_gateway::run::run_from_env(shutdown).await
    })
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
