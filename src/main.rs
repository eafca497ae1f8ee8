use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use uuid::Uuid;

use lead_relay::api::{self, AppState};
use lead_relay::automation::{Dispatcher, spawn_dispatcher};
use lead_relay::channels::{ChannelRouter, EmailSender, HttpSmsSender, SmsConfig, SmtpConfig};
use lead_relay::config::AppConfig;
use lead_relay::events::EventBus;
use lead_relay::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    eprintln!("📇 Lead Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhooks: http://{}/webhook-leads/{{token}}", config.bind_addr);
    eprintln!("   Admin API: http://{}/api/tenants", config.bind_addr);
    eprintln!("   Feed WS: ws://{}/ws/tenants/{{tenant_id}}/events", config.bind_addr);

    // ── Database ─────────────────────────────────────────────────────────
    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // Pending firings survive restarts; whatever is already due goes out on the first pass.
    let due = db.count_due_firings(Utc::now()).await?;
    if due > 0 {
        tracing::info!(due, "Resuming due firings from previous run");
    }

    let bus = EventBus::new(config.feed_capacity);

    // ── Channels ─────────────────────────────────────────────────────────
    let mut router = ChannelRouter::new();
    let mut active_channels = Vec::new();
    let provider_timeout = config.dispatcher.provider_timeout();
    if let Some(smtp) = SmtpConfig::from_env() {
        eprintln!("   Email: enabled (SMTP: {}:{})", smtp.host, smtp.port);
        router = router.with_email(Arc::new(EmailSender::new(&smtp, provider_timeout)?));
        active_channels.push("email");
    }
    if let Some(sms) = SmsConfig::from_env() {
        eprintln!("   SMS: enabled ({})", sms.api_url);
        router = router.with_sms(Arc::new(HttpSmsSender::new(sms, provider_timeout)));
        active_channels.push("sms");
    }
    if active_channels.is_empty() {
        tracing::warn!("No outbound channel configured; due firings will be retried until one is");
    }
    eprintln!(
        "   Channels: {}",
        if active_channels.is_empty() {
            "none".to_string()
        } else {
            active_channels.join(", ")
        }
    );

    // ── Dispatchers ──────────────────────────────────────────────────────
    let sender = Arc::new(router);
    let workers: Vec<_> = (0..config.dispatcher.workers.max(1))
        .map(|i| {
            let short = Uuid::new_v4().simple().to_string();
            let dispatcher = Dispatcher::new(
                Arc::clone(&db),
                sender.clone(),
                bus.clone(),
                config.dispatcher.clone(),
                format!("dispatcher-{i}-{}", &short[..8]),
            );
            spawn_dispatcher(Arc::new(dispatcher))
        })
        .collect();
    eprintln!("   Dispatchers: {}\n", workers.len());

    // ── HTTP ─────────────────────────────────────────────────────────────
    let state = AppState::new(Arc::clone(&db), bus, config.intake.clone());
    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    // Leased firings whose outcome was not recorded are reclaimed after lease expiry.
    for worker in workers {
        worker.abort();
    }
    Ok(())
}
