use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use outreach_agent::api::{self, AppState};
use outreach_agent::config::{OutreachConfig, ServiceConfig};
use outreach_agent::drafting::{DraftRules, Drafter};
use outreach_agent::integrations::{
    AutomationBackend, BookingLedger, MondayConfig, MondayCrm, OpenAiConfig, OpenAiGenerator,
    PhantomBusterBackend, PhantomBusterConfig,
};
use outreach_agent::queue::ApprovalQueue;
use outreach_agent::reconciler::Reconciler;
use outreach_agent::scheduler::{self, Scheduler};
use outreach_agent::store::{Database, LibSqlBackend};

/// First reconcile run looks back this far for replies.
const INITIAL_REPLY_LOOKBACK_HOURS: i64 = 24;

/// Overlap between consecutive reply windows; duplicates are dropped by id.
const REPLY_WINDOW_OVERLAP_MINUTES: i64 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let service = ServiceConfig::from_env()?;

    // ── Logging ─────────────────────────────────────────────────────────
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter());
    let (file, _log_guard) = match &service.log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "outreach-agent.log"));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry().with(stderr).with(file).init();

    let config = OutreachConfig::from_env()?;

    eprintln!("📬 Outreach Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Limits: {} messages / {} profile views per day", config.daily_message_limit, config.daily_profile_view_limit);
    eprintln!(
        "   Hours: {}-{} {}",
        config.working_hours_start.format("%H:%M"),
        config.working_hours_end.format("%H:%M"),
        config.timezone
    );
    eprintln!("   Human approval: {}", config.require_human_approval);
    eprintln!("   API: http://0.0.0.0:{}/api/actions", service.api_port);
    eprintln!("   Approval WS: ws://0.0.0.0:{}/ws", service.api_port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&service.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", service.db_path.display()))?,
    );
    eprintln!("   Database: {}", service.db_path.display());

    // ── Collaborators ───────────────────────────────────────────────────
    let backend: Arc<dyn AutomationBackend> = Arc::new(PhantomBusterBackend::new(
        PhantomBusterConfig::from_env()
            .context("PHANTOMBUSTER_API_KEY and PHANTOMBUSTER_MESSAGE_AGENT_ID must be set")?,
    ));
    let generator = Arc::new(OpenAiGenerator::new(
        OpenAiConfig::from_env().context("OPENAI_API_KEY must be set")?,
    ));
    let calendar = Arc::new(BookingLedger::new(Arc::clone(&db)));

    // ── Core ────────────────────────────────────────────────────────────
    let queue = ApprovalQueue::new(
        Arc::clone(&db),
        chrono::Duration::days(i64::from(config.follow_up_after_days)),
    );

    let drafter = Drafter::new(
        generator,
        DraftRules::new()?,
        config.external_timeout,
        config.generation_attempts,
    );

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&db),
        Arc::clone(&queue),
        drafter,
        Arc::clone(&backend),
        config.clone(),
    ));

    let mut reconciler = Reconciler::new(Arc::clone(&db), backend, calendar, config.external_timeout);
    match MondayConfig::from_env() {
        Some(crm) => {
            reconciler = reconciler.with_crm(Arc::new(MondayCrm::new(crm)));
            eprintln!("   CRM: Monday.com");
        }
        None => eprintln!("   CRM: disabled (MONDAY_API_KEY not set)"),
    }
    let reconciler = Arc::new(reconciler);

    // ── Background jobs ─────────────────────────────────────────────────
    let tick_schedule = cron::Schedule::from_str(&service.tick_schedule)?;
    let _tick_handle = scheduler::spawn_cron_ticker("scheduler", tick_schedule, {
        let scheduler = Arc::clone(&scheduler);
        move || {
            let scheduler = Arc::clone(&scheduler);
            async move {
                if let Err(e) = scheduler.tick(Utc::now()).await {
                    tracing::error!(error = %e, "Scheduler tick failed");
                }
            }
        }
    });

    let reconcile_schedule = cron::Schedule::from_str(&service.reconcile_schedule)?;
    let since = Arc::new(Mutex::new(
        Utc::now() - chrono::Duration::hours(INITIAL_REPLY_LOOKBACK_HOURS),
    ));
    let _reconcile_handle = scheduler::spawn_cron_ticker("reconciler", reconcile_schedule, {
        let reconciler = Arc::clone(&reconciler);
        move || {
            let reconciler = Arc::clone(&reconciler);
            let since = Arc::clone(&since);
            async move {
                let mut since = since.lock().await;
                let started = Utc::now();
                match reconciler.run(*since).await {
                    Ok(_) => {
                        *since = started - chrono::Duration::minutes(REPLY_WINDOW_OVERLAP_MINUTES);
                    }
                    Err(e) => tracing::error!(error = %e, "Reconcile run failed"),
                }
            }
        }
    });

    // ── API server ──────────────────────────────────────────────────────
    let app = api::router(AppState {
        queue,
        reconciler,
        db,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", service.api_port))
        .await
        .with_context(|| format!("failed to bind port {}", service.api_port))?;
    tracing::info!(port = service.api_port, "Approval API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
