mod candidates;
mod classifier;
mod config;
mod db;
mod domain;
mod errors;
mod lock;
mod pipeline;
mod provider;
mod queue;
mod recovery;
mod retry;
mod scheduler;
mod settlement;

use candidates::{CandidateSelector, EliotCandidateSelector, GpsCandidateSelector, VozCandidateSelector};
use clap::Parser;
use config::{Args, AppConfig};
use domain::ServiceKind;
use eyre::{eyre, Result};
use fs2::FileExt;
use lock::RedisLock;
use pipeline::PipelineWorker;
use provider::{HttpProviderClient, ProviderClient};
use queue::FileQueueStore;
use retry::RetryPolicy;
use scheduler::ScheduledWorker;
use settlement::SettlementWriter;
use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;

fn load_providers(service: ServiceKind) -> Vec<Arc<dyn ProviderClient>> {
    let prefix = match service {
        ServiceKind::Gps => "PROVIDER_GPS",
        ServiceKind::Voz => "PROVIDER_VOZ",
        ServiceKind::Eliot => "PROVIDER_ELIOT",
    };

    let mut providers: Vec<Arc<dyn ProviderClient>> = Vec::new();
    for suffix in ["_PRIMARY", "_SECONDARY"] {
        let base_key = format!("{prefix}{suffix}_BASE_URL");
        let key_key = format!("{prefix}{suffix}_API_KEY");
        if let (Ok(base_url), Ok(api_key)) = (std::env::var(&base_key), std::env::var(&key_key)) {
            providers.push(Arc::new(HttpProviderClient::new(
                format!("{service}{suffix}"),
                base_url,
                api_key,
                Duration::from_secs(10),
            )));
        }
    }
    providers
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = AppConfig::from_args(args)?;

    // Single-instance guard alongside the queue directory, the same role as the teacher's fs2
    // lock: this protects one machine even before the cluster-wide Redis lock is consulted.
    std::fs::create_dir_all(&cfg.queue_dir)?;
    let lock_path = cfg.queue_dir.join("recharge-engine.lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|e| eyre!("another instance is already running ({}): {e}", lock_path.display()))?;
    let _lock_guard = lock_file;

    let pool = db::connect(&cfg.database_url, cfg.database_max_connections).await?;
    let redis_lock = Arc::new(RedisLock::connect(&cfg.redis_url).await?);

    tracing::info!(
        timezone = %cfg.timezone,
        once = cfg.once,
        "recharge engine starting"
    );

    let gps_selector: Arc<dyn CandidateSelector> = Arc::new(GpsCandidateSelector::new(pool.clone()));
    let voz_selector: Arc<dyn CandidateSelector> = Arc::new(VozCandidateSelector::new(pool.clone()));
    let eliot_selector: Arc<dyn CandidateSelector> =
        Arc::new(EliotCandidateSelector::new(pool.clone(), pool.clone()));

    let writer = Arc::new(SettlementWriter::new(pool.clone()));

    let mut workers = Vec::new();
    for (service, selector, service_cfg) in [
        (ServiceKind::Gps, gps_selector, cfg.gps.clone()),
        (ServiceKind::Voz, voz_selector, cfg.voz.clone()),
        (ServiceKind::Eliot, eliot_selector, cfg.eliot.clone()),
    ] {
        let providers = load_providers(service);
        if providers.is_empty() {
            tracing::warn!(%service, "no providers configured for this service; ticks will abort with insufficient balance");
        }

        let lock = redis_lock.clone();
        let writer = writer.clone();
        let queue_dir = cfg.queue_dir.clone();
        let timezone = cfg.timezone;
        let actor = cfg.actor.clone();
        let lock_ttl = cfg.lock_ttl;

        let schedule = service_cfg.schedule.clone();
        let handler = move || {
            let lock = lock.clone();
            let writer = writer.clone();
            let selector = selector.clone();
            let providers = providers.clone();
            let queue_dir = queue_dir.clone();
            let timezone = timezone;
            let actor = actor.clone();
            let service_cfg = service_cfg.clone();

            async move {
                let queue = match FileQueueStore::load_or_quarantine(&queue_dir, service) {
                    Ok(q) => q,
                    Err(err) => {
                        tracing::error!(%service, error = %err, "failed to open queue store; skipping tick");
                        return;
                    }
                };

                let provider_refs: Vec<&dyn ProviderClient> =
                    providers.iter().map(|p| p.as_ref()).collect();

                let worker = PipelineWorker {
                    service,
                    lock: lock.as_ref(),
                    queue: &queue,
                    selector: selector.as_ref(),
                    providers: provider_refs,
                    writer: writer.as_ref(),
                    retry_policy: RetryPolicy::default(),
                    lock_ttl,
                    inter_call_delay: Duration::ZERO,
                    minutes_threshold: service_cfg.minutes_threshold,
                    activity_cap_days: service_cfg.activity_cap_days,
                    revalidation_window_days: service_cfg.revalidation_window_days,
                    timezone,
                    actor,
                };

                if let Err(err) = worker.run_tick(chrono::Utc::now()).await {
                    tracing::error!(%service, error = %err, "tick failed");
                }
            }
        };

        if cfg.once {
            handler().await;
        } else {
            workers.push(ScheduledWorker::start(service.to_string(), schedule, timezone, handler));
        }
    }

    if cfg.once {
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received; draining in-flight ticks");
    for worker in workers {
        worker.stop().await;
    }

    Ok(())
}
