use std::sync::Arc;

use anyhow::Context;
use cloud_scheduler::config::AppConfig;
use cloud_scheduler::providers::fs::FsHistoryStore;
use cloud_scheduler::providers::in_memory::InMemoryHistoryStore;
use cloud_scheduler::providers::HistoryStore;
use cloud_scheduler::workflows::notify::{Notifier, RecordingNotifier, SlackWebhookNotifier};
use cloud_scheduler::{http, workflows, Runtime};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();

    let config = AppConfig::from_env().context("reading configuration")?;

    let store: Arc<dyn HistoryStore> = match &config.data_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "using file history store");
            Arc::new(FsHistoryStore::new(dir, false))
        }
        None => {
            warn!("DATA_DIR not set; history is kept in memory only");
            Arc::new(InMemoryHistoryStore::default())
        }
    };
    let notifier: Arc<dyn Notifier> = match &config.slack_hook_url {
        Some(url) => Arc::new(SlackWebhookNotifier::new(url.clone())),
        None => Arc::new(RecordingNotifier::default()),
    };
    if config.require_host_name().is_err() {
        warn!("WEBSITE_HOSTNAME not set; approval buttons carry no direct links");
    }

    let activities = Arc::new(workflows::activities(notifier, config.host_name.clone()));
    let runtime = Runtime::start_with_store(store, activities, workflows::orchestrations()).await;

    let bind_addr = config.bind_addr;
    let app = http::router(runtime.clone(), Arc::new(config));
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving http")?;

    info!("shutting down");
    runtime.shutdown().await;
    Ok(())
}
