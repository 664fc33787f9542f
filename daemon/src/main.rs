//! dbwatchd: builds the application context once, then drives the two
//! periodic loops (health monitoring + auto-remediation, scheduled jobs)
//! until shutdown. The HTTP presentation layer lives elsewhere; this
//! binary is only the control loop driver plus a few one-shot chaos
//! subcommands for operating the fault injector by hand.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dbwatch_core::chaos::ChaosEngine;
use dbwatch_core::config::WatchConfig;
use dbwatch_core::domain::Severity;
use dbwatch_core::error::AppError;
use dbwatch_core::incidents::{CreateIncident, IncidentManager};
use dbwatch_core::jobs::JobRunner;
use dbwatch_core::monitor::healthcare::HealthcareCollector;
use dbwatch_core::monitor::HealthCollector;
use dbwatch_core::remediation::{ActionRegistry, RemediationEngine, RuleSet};
use dbwatch_core::store::Store;

#[derive(Parser)]
#[command(name = "dbwatchd", about = "Database health watcher and incident auto-remediator")]
struct Cli {
    /// SQLite database file holding both the monitored schema and
    /// dbwatch's own bookkeeping tables.
    #[arg(long, default_value = "dbwatch.sqlite")]
    db: PathBuf,

    /// TOML config file; missing file means built-in defaults.
    #[arg(long, default_value = "dbwatch.toml")]
    config: PathBuf,

    /// Run a single monitor cycle and exit (smoke testing).
    #[arg(long)]
    once: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List fault-injection scenarios and their cooldown state.
    Scenarios,
    /// Trigger one fault-injection scenario by name.
    Trigger { name: String },
    /// Trigger a random off-cooldown scenario.
    TriggerRandom,
}

/// Everything the loops need, constructed once at startup and shared by
/// handle. No global mutable state.
struct AppContext {
    config: WatchConfig,
    incidents: IncidentManager,
    remediation: RemediationEngine,
    chaos: ChaosEngine,
    health: HealthCollector,
    healthcare: HealthcareCollector,
    jobs: JobRunner,
}

impl AppContext {
    fn new(store: Arc<Store>, config: WatchConfig) -> Self {
        let incidents = IncidentManager::new(Arc::clone(&store));
        let rules = if config.rules.is_empty() {
            RuleSet::default_rules()
        } else {
            RuleSet::new(config.rules.clone())
        };
        let remediation = RemediationEngine::new(
            Arc::clone(&store),
            incidents.clone(),
            rules,
            ActionRegistry::builtin(),
        );
        let chaos = ChaosEngine::new(
            Arc::clone(&store),
            incidents.clone(),
            Duration::from_secs(config.chaos.cooldown_seconds),
        );
        let health = HealthCollector::new(Arc::clone(&store), config.thresholds.clone());
        let healthcare = HealthcareCollector::new(Arc::clone(&store), config.thresholds.clone());
        let jobs = JobRunner::new(Arc::clone(&store), config.jobs.clone());
        Self {
            config,
            incidents,
            remediation,
            chaos,
            health,
            healthcare,
            jobs,
        }
    }
}

/// One pass of the control loop: collect alerts, open incidents for the
/// critical ones, auto-remediate, escalate the stale. Any error aborts the
/// cycle; the loop retries by cadence, never inline.
fn monitor_cycle(ctx: &AppContext) -> Result<(), AppError> {
    let (_, alerts) = ctx.health.collect_snapshot()?;
    open_critical_incidents(ctx, &alerts, "health")?;

    let (_, hc_alerts) = ctx.healthcare.collect()?;
    open_critical_incidents(ctx, &hc_alerts, "healthcare")?;

    if ctx.config.monitor.auto_remediate {
        let reports = ctx.remediation.remediate_open_incidents()?;
        if !reports.is_empty() {
            info!(attempts = reports.len(), "remediation pass finished");
        }
    }

    let escalated = ctx
        .incidents
        .check_escalations(ctx.config.monitor.escalation_timeout_seconds)?;
    if !escalated.is_empty() {
        warn!(count = escalated.len(), "stale incidents escalated");
    }

    Ok(())
}

/// Open one deduplicated incident per critical alert. The key prefix keeps
/// server-health and healthcare alert streams from colliding on a metric
/// name.
fn open_critical_incidents(
    ctx: &AppContext,
    alerts: &[dbwatch_core::domain::Alert],
    key_prefix: &str,
) -> Result<(), AppError> {
    for alert in alerts {
        if alert.level == dbwatch_core::domain::AlertLevel::Critical {
            ctx.incidents.create(
                CreateIncident::new(
                    alert.metric.clone(),
                    format!(
                        "Critical: {} = {} (threshold: {})",
                        alert.metric, alert.value, alert.threshold
                    ),
                    Severity::Critical,
                )
                .with_dedup_key(format!("{}_{}", key_prefix, alert.metric)),
            )?;
        }
    }
    Ok(())
}

async fn monitor_loop(ctx: Arc<AppContext>) {
    let period = Duration::from_secs(ctx.config.monitor.poll_interval_seconds.max(1));
    info!(interval_s = period.as_secs(), "monitor loop started");
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if let Err(e) = monitor_cycle(&ctx) {
            error!(error = %e, retryable = e.retryable, "monitor cycle failed");
        }
    }
}

async fn job_loop(ctx: Arc<AppContext>) {
    info!(jobs = ctx.jobs.jobs().len(), "job runner started");
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;
        if let Err(e) = ctx.jobs.run_due() {
            error!(error = %e, "job runner pass failed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = WatchConfig::load(&cli.config)?;
    let store = Arc::new(Store::open(&cli.db)?);
    let ctx = Arc::new(AppContext::new(store, config));

    match cli.command {
        Some(Command::Scenarios) => {
            for s in ctx.chaos.list_scenarios() {
                println!("{}", serde_json::to_string(&s).unwrap_or_default());
            }
            return Ok(());
        }
        Some(Command::Trigger { name }) => {
            let outcome = ctx.chaos.trigger(&name)?;
            println!("{}", serde_json::to_string(&outcome).unwrap_or_default());
            return Ok(());
        }
        Some(Command::TriggerRandom) => {
            let outcome = ctx.chaos.trigger_random()?;
            println!("{}", serde_json::to_string(&outcome).unwrap_or_default());
            return Ok(());
        }
        None => {}
    }

    if cli.once {
        monitor_cycle(&ctx)?;
        let _ = ctx.jobs.run_due()?;
        return Ok(());
    }

    let monitor = tokio::spawn(monitor_loop(Arc::clone(&ctx)));
    let jobs = tokio::spawn(job_loop(Arc::clone(&ctx)));

    tokio::signal::ctrl_c().await.map_err(|e| {
        AppError::new("SIGNAL_FAILED", "Failed to wait for shutdown signal")
            .with_details(e.to_string())
    })?;

    // Abrupt shutdown is accepted: an incident stuck in `remediating` is
    // picked up by the next escalation sweep after restart.
    monitor.abort();
    jobs.abort();
    info!("dbwatchd shutdown complete");
    Ok(())
}
