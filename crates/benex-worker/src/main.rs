use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use benex_provider::{BundleClient, HttpBundleClient};
use benex_queue::{PostgresQueue, QueueTransport};
use benex_store::{JobStore, PostgresStore};
use benex_worker::{
    AppConfig, Alerter, CleanupWorker, ClientFactory, ExportWorker, NoopAlerter,
    PrepareWorker, ProcessJobHandler, WebhookAlerter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate().map_err(anyhow::Error::msg)?;

    let store: Arc<dyn JobStore> = Arc::new(
        PostgresStore::new(&config.database)
            .await
            .context("failed to connect job store")?,
    );
    let queue = Arc::new(
        PostgresQueue::new(config.queue.clone())
            .await
            .context("failed to connect work queue")?,
    );

    let provider_config = config.provider.clone();
    let clients: ClientFactory = Arc::new(move |base_path| {
        HttpBundleClient::new(provider_config.clone(), base_path)
            .map(|client| Arc::new(client) as Arc<dyn BundleClient>)
    });

    let alerter: Arc<dyn Alerter> = match &config.worker.alert_webhook_url {
        Some(url) => Arc::new(WebhookAlerter::new(url.clone())),
        None => Arc::new(NoopAlerter),
    };

    let export = Arc::new(ExportWorker::new(
        store.clone(),
        clients.clone(),
        config.worker.clone(),
    ));

    queue.register(
        "prepare_job",
        Arc::new(PrepareWorker::new(
            store.clone(),
            clients,
            queue.clone() as Arc<dyn QueueTransport>,
            config.worker.clone(),
        )),
    );
    queue.register(
        "process_job",
        Arc::new(ProcessJobHandler::new(
            export,
            store.clone(),
            config.worker.clone(),
        )),
    );
    queue.register(
        "cleanup_job",
        Arc::new(CleanupWorker::new(store, config.worker.clone(), alerter)),
    );

    queue.start(config.worker.worker_count).await?;
    tracing::info!(
        workers = config.worker.worker_count,
        "benex worker started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    queue.stop().await;
    Ok(())
}
