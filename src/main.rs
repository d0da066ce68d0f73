use std::sync::Arc;
use std::time::Duration;

use leadflow::config::PipelineConfig;
use leadflow::decision::{DecisionEngine, HttpDecisionEngine, HttpDecisionEngineConfig};
use leadflow::gateway::{Channel, GatewayRegistry, HttpGateway, HttpGatewayConfig, SmtpConfig, SmtpGateway};
use leadflow::notifier::{EscalationNotifier, TracingNotifier, WebhookNotifier};
use leadflow::orchestrator::{Orchestrator, spawn_event_loop};
use leadflow::scheduler::{Scheduler, spawn_sweep_task, spawn_tick_task, sweep_schedule};
use leadflow::server::{AppState, routes};
use leadflow::store::{LeadStore, LibSqlStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PipelineConfig::from_env();

    let port: u16 = std::env::var("LEADFLOW_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    eprintln!("📈 Leadflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/", port);
    eprintln!("   Ingest: POST http://0.0.0.0:{}/leads/ingest", port);
    eprintln!(
        "   Follow-up ladder: {} rungs, tick every {}s\n",
        config.max_followups(),
        config.tick_interval.as_secs()
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("LEADFLOW_DB_PATH").unwrap_or_else(|_| "./data/leadflow.db".to_string());
    let store: Arc<dyn LeadStore> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", db_path, e);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", db_path);

    // ── Decision engine ──────────────────────────────────────────────────
    let engine_config = HttpDecisionEngineConfig::from_env().unwrap_or_else(|| {
        eprintln!("Error: DECISION_ENGINE_URL not set");
        eprintln!("  export DECISION_ENGINE_URL=https://...");
        std::process::exit(1);
    });
    let decision: Arc<dyn DecisionEngine> = Arc::new(HttpDecisionEngine::new(
        engine_config,
        config.decision_timeout,
    ));

    // ── Channel gateways ─────────────────────────────────────────────────
    let mut registry = GatewayRegistry::new(
        config.gateway_attempts,
        config.gateway_backoff_base,
        config.gateway_timeout,
    );
    let mut active = Vec::new();
    for (channel, prefix) in [
        (Channel::Voice, "VOICE"),
        (Channel::Chat, "CHAT"),
        (Channel::Crm, "CRM"),
        (Channel::Contract, "CONTRACT"),
        (Channel::Payment, "PAYMENT"),
    ] {
        if let Some(gw_config) = HttpGatewayConfig::from_env(channel, prefix) {
            registry.register(Arc::new(HttpGateway::new(gw_config, config.gateway_timeout)));
            active.push(channel.to_string());
        }
    }
    if let Some(smtp) = SmtpConfig::from_env() {
        registry.register(Arc::new(SmtpGateway::new(smtp)));
        active.push("email".to_string());
    }
    if active.is_empty() {
        eprintln!("   Warning: no channel gateways configured, outreach will fail");
    } else {
        eprintln!("   Channels: {}", active.join(", "));
    }
    let gateways = Arc::new(registry);

    // ── Escalation notifier ──────────────────────────────────────────────
    let notifier: Arc<dyn EscalationNotifier> = match std::env::var("ESCALATION_WEBHOOK_URL") {
        Ok(url) => {
            eprintln!("   Escalations: webhook");
            Arc::new(WebhookNotifier::new(url, Duration::from_secs(10)))
        }
        Err(_) => {
            eprintln!("   Escalations: log only (set ESCALATION_WEBHOOK_URL)");
            Arc::new(TracingNotifier)
        }
    };

    // ── Event loop, scheduler, sweep ─────────────────────────────────────
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(256);

    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), event_tx.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        decision,
        gateways,
        Arc::clone(&scheduler),
        notifier,
        config.clone(),
    ));

    let _event_loop = spawn_event_loop(orchestrator, event_rx, config.max_concurrent_events);
    let _tick = spawn_tick_task(Arc::clone(&scheduler), config.tick_interval);
    let _sweep = spawn_sweep_task(
        Arc::clone(&store),
        event_tx.clone(),
        sweep_schedule(&config.sweep_schedule),
    );

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = routes(AppState {
        store,
        events: event_tx,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(port, "Leadflow server started");
    axum::serve(listener, app).await?;

    Ok(())
}
