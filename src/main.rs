use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use mockable::{Clock, DefaultClock};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use taskdesk::channels::http::build_client;
use taskdesk::channels::oauth::OAuthStates;
use taskdesk::channels::{
    ChannelAdapter, ChannelDeps, FacebookAdapter, GmailAdapter, Ingestor, LinkedInAdapter,
    PollSupervisor, TwitterAdapter, WhatsAppAdapter,
};
use taskdesk::config::AppConfig;
use taskdesk::scheduler::Scheduler;
use taskdesk::store::{Database, LibSqlBackend};
use taskdesk::tasks::TaskEngine;
use taskdesk::web::{self, WebState};

/// Stderr logging, plus a daily-rotated file when `log_dir` is set.
///
/// The returned guard must live until exit so buffered lines are flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "taskdesk.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        db = %config.db_path.display(),
        "Taskdesk starting"
    );

    // ── Store and engine ────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    let clock: Arc<dyn Clock> = Arc::new(DefaultClock);
    let engine = Arc::new(
        TaskEngine::new(Arc::clone(&db), Arc::clone(&clock), config.lifecycle.clone())
            .await
            .context("failed to start the task engine")?,
    );

    let oauth = Arc::new(OAuthStates::new(Arc::clone(&db), Arc::clone(&clock)));
    let purged = oauth.purge().await?;
    if purged > 0 {
        info!(purged, "Removed expired OAuth states");
    }

    // ── Channels ────────────────────────────────────────────────────────
    let client = build_client(&config.retry)?;
    let deps = ChannelDeps::new(Arc::clone(&db), Arc::clone(&clock), client)
        .with_retry(config.retry)
        .with_refresh_buffer(config.token_refresh_buffer);

    let mut adapters: Vec<Arc<dyn ChannelAdapter>> = Vec::new();
    if let Some(c) = config.gmail.clone() {
        adapters.push(Arc::new(GmailAdapter::new(c, deps.clone())));
    }
    let whatsapp: Option<Arc<dyn ChannelAdapter>> = config
        .whatsapp
        .clone()
        .map(|c| Arc::new(WhatsAppAdapter::new(c, deps.clone())) as Arc<dyn ChannelAdapter>);
    if let Some(adapter) = &whatsapp {
        adapters.push(Arc::clone(adapter));
    }
    if let Some(c) = config.linkedin.clone() {
        adapters.push(Arc::new(LinkedInAdapter::new(c, deps.clone())));
    }
    if let Some(c) = config.twitter.clone() {
        adapters.push(Arc::new(TwitterAdapter::new(c, deps.clone())));
    }
    if let Some(c) = config.facebook.clone() {
        adapters.push(Arc::new(FacebookAdapter::new(c, deps.clone())));
    }

    let whatsapp_signature = config
        .whatsapp
        .as_ref()
        .and_then(|c| c.webhook_signature());
    if whatsapp.is_some() && whatsapp_signature.is_none() {
        warn!("WHATSAPP_WEBHOOK_URL is not set, webhook signatures are not checked");
    }

    let ingestor = Arc::new(Ingestor::new(Arc::clone(&engine)));
    let mut supervisor = PollSupervisor::new(Arc::clone(&ingestor), config.shutdown_grace);
    if adapters.is_empty() {
        warn!("No channels configured, only the API and scheduler will run");
    }
    for adapter in adapters {
        info!(channel = %adapter.kind(), "Channel enabled");
        supervisor.spawn_channel(adapter);
    }

    // ── Scheduler ───────────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&engine), &config.scheduler));
    if !scheduler.is_empty() {
        info!(schedules = scheduler.len(), "Scheduler enabled");
        let shutdown = supervisor.subscribe();
        supervisor.spawn("scheduler", scheduler.run(shutdown));
    }

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = web::routes(WebState {
        engine: Arc::clone(&engine),
        ingestor,
        oauth,
        whatsapp,
        whatsapp_signature,
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    info!(port = config.http_port, "HTTP server started");
    let mut http_shutdown = supervisor.subscribe();
    supervisor.spawn("http", async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = http_shutdown.wait_for(|stop| *stop).await;
        });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    supervisor.shutdown().await;
    Ok(())
}
