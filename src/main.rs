use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use outreach_dispatch::alerts::AlertBus;
use outreach_dispatch::api::control_routes;
use outreach_dispatch::browser::{HttpDriver, Orchestrator};
use outreach_dispatch::channels::{
    AdapterRegistry, BrowserSendAdapter, EmailAdapter, EmailConfig, TelegramAdapter,
};
use outreach_dispatch::config::DispatchConfig;
use outreach_dispatch::policy::PolicyRules;
use outreach_dispatch::router::{self, Router, RouterDeps};
use outreach_dispatch::store::LibSqlStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing, optionally mirrored to a daily-rotated file
    let (file_layer, _log_guard) = match std::env::var("DISPATCH_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    let config = DispatchConfig::from_env().context("invalid configuration")?;
    let rules = PolicyRules::from_config(&config.policy).context("invalid policy")?;

    eprintln!("📮 Outreach Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Claimant: {}", config.router.claimant);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.api.db_path);
    let store = Arc::new(
        LibSqlStore::new_local(db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.api.db_path))?,
    );
    eprintln!("   Database: {}", config.api.db_path);

    let alerts = AlertBus::new();

    // ── Browser orchestrator ─────────────────────────────────────────────
    let driver = Arc::new(HttpDriver::new().context("failed to build browser driver")?);
    let orchestrator = Orchestrator::new(
        config.orchestrator.clone(),
        driver,
        store.clone(),
        store.clone(),
        alerts.clone(),
    );
    let recovered = orchestrator
        .recover()
        .await
        .context("failed to recover browser jobs")?;
    eprintln!(
        "   Browser jobs: {} waiting, {} requeued, {} interrupted",
        recovered.waiting, recovered.requeued, recovered.interrupted
    );
    let _sweeper = orchestrator.spawn_sweeper();

    // ── Channel adapters ─────────────────────────────────────────────────
    let mut adapters = AdapterRegistry::new();
    if let Some(email_config) = EmailConfig::from_env() {
        eprintln!("   Email: enabled (SMTP: {})", email_config.smtp_host);
        adapters.register(Arc::new(
            EmailAdapter::new(email_config).context("failed to start email adapter")?,
        ));
    }
    if let Some(telegram) = TelegramAdapter::from_env() {
        eprintln!("   Telegram: enabled");
        adapters.register(Arc::new(telegram));
    }
    for channel in &config.orchestrator.channels {
        adapters.register(Arc::new(BrowserSendAdapter::new(
            channel.clone(),
            orchestrator.clone(),
        )));
    }
    eprintln!("   Channels: {}", adapters.channels().join(", "));

    // ── Router ───────────────────────────────────────────────────────────
    let deps = RouterDeps {
        store: store.clone(),
        ledger: store.clone(),
        counters: store.clone(),
        dnc: store.clone(),
        adapters,
        alerts: alerts.clone(),
    };
    let dispatch = Arc::new(
        Router::new(deps, rules, config.retry.clone(), config.router.clone())
            .with_job_tracker(Arc::new(orchestrator.clone())),
    );

    if let Some(ref expr) = config.router.drain_cron {
        let schedule = router::parse_schedule(expr)?;
        let _ticker = router::spawn_drain_ticker(Arc::clone(&dispatch), schedule);
        eprintln!("   Drain: cron {expr}");
    } else {
        eprintln!("   Drain: external (POST /dispatch/drain)");
    }

    // ── Control API ──────────────────────────────────────────────────────
    let app = control_routes(orchestrator.clone(), dispatch);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.api.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.api.port))?;
    tracing::info!(port = config.api.port, "Control API started");
    eprintln!("   API: http://0.0.0.0:{}\n", config.api.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    orchestrator.shutdown();
    tracing::info!("Shut down");
    Ok(())
}
