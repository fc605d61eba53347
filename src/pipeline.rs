use crate::candidates::CandidateSelector;
use crate::classifier::{classify, ClassifierThresholds};
use crate::domain::{
    ClassificationCounts, Device, NoteContext, PendingRecharge, PendingStatus, ServiceKind,
};
use crate::errors::ErrorCategory;
use crate::lock::DistributedLock;
use crate::provider::{categorize, ProviderClient};
use crate::queue::QueueStore;
use crate::recovery::run_recovery;
use crate::retry::RetryPolicy;
use crate::settlement::SettlementWriter;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Borrowed (not owned) collaborators for one service's tick (spec §9 ownership tree):
/// PipelineWorker borrows LockClient, EventSink (tracing), QueueStore, ProviderClient, DBClient;
/// Orchestrator owns the PipelineWorker itself.
pub struct PipelineWorker<'a> {
    pub service: ServiceKind,
    pub lock: &'a dyn DistributedLock,
    pub queue: &'a dyn QueueStore,
    pub selector: &'a dyn CandidateSelector,
    pub providers: Vec<&'a dyn ProviderClient>,
    pub writer: &'a SettlementWriter,
    pub retry_policy: RetryPolicy,
    pub lock_ttl: Duration,
    pub inter_call_delay: Duration,
    pub minutes_threshold: i64,
    pub activity_cap_days: i64,
    pub revalidation_window_days: i64,
    pub timezone: chrono_tz::Tz,
    pub actor: String,
}

#[derive(Debug, Default)]
pub struct TickSummary {
    pub classification: ClassificationCounts,
    pub successes: usize,
    pub failures: usize,
    pub queue_depth_after: usize,
    pub skipped: Option<&'static str>,
}

impl<'a> PipelineWorker<'a> {
    /// One tick for one service (spec §4.8). Returns a summary even when the tick is skipped, so
    /// the caller can log a concise line per spec §7's "user-visible failure behavior".
    pub async fn run_tick(&self, now: DateTime<Utc>) -> eyre::Result<TickSummary> {
        let key = self.service.lock_key();

        // 1. Acquire the distributed lock.
        let guard = match self.lock.acquire(key, self.lock_ttl).await? {
            Some(guard) => guard,
            None => {
                tracing::info!(service = %self.service, "lock contention; tick skipped");
                return Ok(TickSummary {
                    skipped: Some("lock_contention"),
                    ..Default::default()
                });
            }
        };

        let result = self.run_locked(now).await;

        if let Err(err) = self.lock.release(key, &guard.token).await {
            tracing::warn!(service = %self.service, error = %err, "failed to release lock");
        }

        result
    }

    async fn run_locked(&self, now: DateTime<Utc>) -> eyre::Result<TickSummary> {
        // 2. Recover any items left from a previous tick/restart before issuing new calls.
        let recovery = run_recovery(
            self.queue,
            self.writer,
            self.service,
            &self.actor,
            now,
            self.timezone,
        )
        .await?;

        if !recovery.drained {
            tracing::warn!(
                service = %self.service,
                still_blocked = recovery.still_blocked,
                "recovery did not drain queue; skipping new provider calls this tick"
            );
            let depth = self.queue.snapshot().await?.len();
            return Ok(TickSummary {
                queue_depth_after: depth,
                skipped: Some("blocked_recovery"),
                ..Default::default()
            });
        }

        // 3. Candidate selection.
        let end_of_today = crate::config::end_of_today(now, self.timezone);
        let candidates = self
            .selector
            .candidates(
                now,
                end_of_today,
                self.activity_cap_days,
                self.revalidation_window_days,
            )
            .await?;

        if candidates.is_empty() {
            return Ok(TickSummary {
                skipped: Some("no_candidates"),
                ..Default::default()
            });
        }

        // 4. Classify.
        let thresholds = ClassifierThresholds {
            minutes_threshold: self.minutes_threshold,
        };
        let classified = classify(&candidates, thresholds);
        let counts = ClassificationCounts {
            recharge: classified.recharge.len(),
            grace: classified.grace.len(),
            stable: classified.stable.len(),
        };

        // 5. Provider selection: sort by balance desc, pick the first that clears the bar.
        let mut providers_with_balance = Vec::new();
        for provider in &self.providers {
            let balance = provider.balance().await?;
            providers_with_balance.push((balance, *provider));
        }
        providers_with_balance.sort_by(|a, b| b.0.cmp(&a.0));

        if classified.recharge.is_empty() {
            return Ok(TickSummary {
                classification: counts,
                ..Default::default()
            });
        }

        let unit_amount = classified.recharge[0].unit_amount;
        if providers_with_balance
            .first()
            .map(|(bal, _)| *bal < unit_amount)
            .unwrap_or(true)
        {
            tracing::warn!(service = %self.service, "no provider with sufficient balance; tick aborted");
            return Ok(TickSummary {
                classification: counts,
                skipped: Some("insufficient_balance"),
                ..Default::default()
            });
        }

        // 6. Device loop: sequential, one provider call chain per device, with failover.
        let mut provider_idx = 0usize;
        let mut successes = 0usize;
        let mut failures = 0usize;
        let total_to_recharge = classified.recharge.len();

        for (idx, candidate) in classified.recharge.iter().enumerate() {
            let device = candidate.device.clone();
            let mut attempt = 0u32;
            let mut settled = false;

            'attempts: loop {
                if provider_idx >= providers_with_balance.len() {
                    failures += 1;
                    tracing::error!(service = %self.service, sim = %device.sim, "no eligible provider left; device failed");
                    break 'attempts;
                }
                let (_, provider) = providers_with_balance[provider_idx];
                attempt += 1;

                let result = provider.recharge(&device.sim, &candidate.product_code).await?;

                if result.success {
                    let note_context = NoteContext {
                        current_index: idx,
                        total_to_recharge,
                        grace_count: classified.grace.len(),
                        total_candidates: candidates.len(),
                    };
                    let item = PendingRecharge {
                        id: Uuid::new_v4(),
                        service: self.service,
                        sim: device.sim.clone(),
                        provider_name: provider.name().to_string(),
                        unit_amount: candidate.unit_amount,
                        days_of_validity: candidate.days_of_validity,
                        folio: result.folio.clone(),
                        trans_id: result.trans_id.clone(),
                        final_balance: result.final_balance,
                        minutes_since_last_report: candidate.minutes_since_last_report,
                        raw: result.raw.clone(),
                        device: device.clone(),
                        note_context,
                        status: PendingStatus::WebserviceSuccessPendingDb,
                        attempts: attempt,
                        created_at: now,
                        last_touched_at: now,
                    };

                    // Ordering guarantee (spec §4.8): this append must be durable before moving on.
                    self.queue.append(item).await?;
                    successes += 1;
                    settled = true;
                    break 'attempts;
                }

                let category = categorize(&result).unwrap_or(ErrorCategory::Retriable);
                let decision = self.retry_policy.decide(category, attempt, device_jitter_seed(&device, attempt));

                if category == ErrorCategory::Retriable && attempt > 2 {
                    // Provider failover after repeated RETRIABLE failures (spec §4.8 step 6, §4.4).
                    provider_idx += 1;
                    attempt = 0;
                    continue 'attempts;
                }

                if decision.retry {
                    tokio::time::sleep(decision.delay).await;
                    continue 'attempts;
                }

                failures += 1;
                tracing::warn!(
                    service = %self.service,
                    sim = %device.sim,
                    category = ?category,
                    "device recharge exhausted retries"
                );
                break 'attempts;
            }

            let _ = settled;
            if self.inter_call_delay > Duration::ZERO {
                tokio::time::sleep(self.inter_call_delay).await;
            }
        }

        // 7. Settle this tick's successes.
        let snapshot = self.queue.snapshot().await?;
        let this_tick: Vec<PendingRecharge> = snapshot
            .into_iter()
            .filter(|i| i.status == PendingStatus::WebserviceSuccessPendingDb)
            .collect();

        if !this_tick.is_empty() {
            match self
                .writer
                .settle_batch(self.service, &this_tick, &self.actor, now, self.timezone, false)
                .await
            {
                Ok(batch) => {
                    for id in batch.settled.iter().chain(batch.duplicates.iter()) {
                        self.queue.remove(*id).await?;
                    }
                    for id in &batch.unverified {
                        let id = *id;
                        self.queue
                            .update(
                                id,
                                Box::new(move |item| {
                                    item.mark_attempt(PendingStatus::DbVerificationFailed, now);
                                }),
                            )
                            .await?;
                    }
                }
                Err(err) => {
                    tracing::error!(service = %self.service, error = %err, "settlement failed; items left for recovery");
                    for item in &this_tick {
                        let id = item.id;
                        self.queue
                            .update(
                                id,
                                Box::new(move |item| {
                                    item.mark_attempt(
                                        PendingStatus::DbInsertionFailedPendingRecovery,
                                        now,
                                    );
                                }),
                            )
                            .await?;
                    }
                }
            }
        }

        let queue_depth_after = self.queue.snapshot().await?.len();

        tracing::info!(
            service = %self.service,
            recharge = counts.recharge,
            grace = counts.grace,
            stable = counts.stable,
            successes,
            failures,
            queue_depth_after,
            "tick complete"
        );

        Ok(TickSummary {
            classification: counts,
            successes,
            failures,
            queue_depth_after,
            skipped: None,
        })
    }
}

/// Deterministic jitter seed derived from the device and attempt, not a live RNG (teacher's
/// `compute_backoff_seconds` modulo-jitter, generalized beyond u64 subscription ids).
fn device_jitter_seed(device: &Device, attempt: u32) -> u64 {
    let mut hash: u64 = 1469598103934665603;
    for byte in device.sim.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash.wrapping_add(attempt as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Candidate, ExpiryState, ProviderErrorPayload, RechargeResult};
    use crate::lock::InMemoryLock;
    use crate::provider::MockProviderClient;
    use crate::queue::FileQueueStore;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::path::PathBuf;

    struct FixedCandidateSelector(Vec<Candidate>);

    #[async_trait]
    impl CandidateSelector for FixedCandidateSelector {
        fn service(&self) -> ServiceKind {
            ServiceKind::Gps
        }
        async fn candidates(
            &self,
            _now: DateTime<Utc>,
            _end_of_today: DateTime<Utc>,
            _activity_cap_days: i64,
            _revalidation_window_days: i64,
        ) -> eyre::Result<Vec<Candidate>> {
            Ok(self.0.clone())
        }
    }

    fn candidate(sim: &str, minutes: i64, state: ExpiryState) -> Candidate {
        Candidate {
            device: Device {
                sim: sim.to_string(),
                service: ServiceKind::Gps,
                description: "unit".into(),
                company: "acme".into(),
                hardware_id: "hw".into(),
                device_id: 1,
                expiry: None,
                last_report: None,
                active: true,
                company_active: true,
            },
            minutes_since_last_report: Some(minutes),
            days_since_last_report: Some(0),
            expiry_state: state,
            unit_amount: Decimal::new(1000, 2),
            days_of_validity: 8,
            product_code: "GPS1".into(),
        }
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("recharge-pipeline-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[tokio::test]
    async fn lock_contention_skips_the_tick_without_calling_candidates() {
        let lock = InMemoryLock::default();
        let _held = lock
            .acquire(ServiceKind::Gps.lock_key(), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let dir = tempdir();
        let queue = FileQueueStore::load_or_quarantine(&dir, ServiceKind::Gps).unwrap();
        let selector = FixedCandidateSelector(vec![candidate("555", 20, ExpiryState::Expired)]);
        let mock_provider = MockProviderClient::new("p1", Decimal::new(10000, 2));
        // No pool available in this unit test; settlement is unreachable because the tick is
        // skipped before it would be invoked.
        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/does-not-exist").unwrap();
        let writer = SettlementWriter::new(pool);

        let worker = PipelineWorker {
            service: ServiceKind::Gps,
            lock: &lock,
            queue: &queue,
            selector: &selector,
            providers: vec![&mock_provider],
            writer: &writer,
            retry_policy: RetryPolicy::default(),
            lock_ttl: Duration::from_secs(60),
            inter_call_delay: Duration::ZERO,
            minutes_threshold: 10,
            activity_cap_days: 14,
            revalidation_window_days: 6,
            timezone: chrono_tz::America::Mazatlan,
            actor: "keeper".into(),
        };

        let summary = worker.run_tick(Utc::now()).await.unwrap();
        assert_eq!(summary.skipped, Some("lock_contention"));
    }

    #[tokio::test]
    async fn successful_recharge_appends_to_the_queue_before_settlement() {
        let lock = InMemoryLock::default();
        let dir = tempdir();
        let queue = FileQueueStore::load_or_quarantine(&dir, ServiceKind::Gps).unwrap();
        let selector = FixedCandidateSelector(vec![candidate("555", 20, ExpiryState::Expired)]);

        let mock_provider = MockProviderClient::new("p1", Decimal::new(10000, 2));
        mock_provider.push_result(Ok(RechargeResult {
            success: true,
            folio: Some("F1".into()),
            trans_id: Some("T1".into()),
            final_balance: Some(Decimal::new(9000, 2)),
            carrier: Some("telcel".into()),
            timeout_observed_ms: Some(120),
            ip: Some("10.0.0.1".into()),
            raw: serde_json::json!({}),
            error: None,
        }));

        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/does-not-exist").unwrap();
        let writer = SettlementWriter::new(pool);

        let worker = PipelineWorker {
            service: ServiceKind::Gps,
            lock: &lock,
            queue: &queue,
            selector: &selector,
            providers: vec![&mock_provider],
            writer: &writer,
            retry_policy: RetryPolicy::default(),
            lock_ttl: Duration::from_secs(60),
            inter_call_delay: Duration::ZERO,
            minutes_threshold: 10,
            activity_cap_days: 14,
            revalidation_window_days: 6,
            timezone: chrono_tz::America::Mazatlan,
            actor: "keeper".into(),
        };

        // Settlement will fail (no real DB), so we expect the item to remain queued with
        // db_insertion_failed_pending_recovery rather than silently vanish (P3: no lost charge).
        let summary = worker.run_tick(Utc::now()).await.unwrap();
        assert_eq!(summary.successes, 1);
        let remaining = queue.snapshot().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, PendingStatus::DbInsertionFailedPendingRecovery);
    }

    #[tokio::test]
    async fn repeated_retriable_failures_fail_over_to_the_next_provider() {
        tokio::time::pause();

        let lock = InMemoryLock::default();
        let dir = tempdir();
        let queue = FileQueueStore::load_or_quarantine(&dir, ServiceKind::Gps).unwrap();
        let selector = FixedCandidateSelector(vec![candidate("555", 20, ExpiryState::Expired)]);

        // Higher balance so it sorts first and is tried before failover (spec §4.8 step 5).
        let primary = MockProviderClient::new("primary", Decimal::new(20000, 2));
        for _ in 0..3 {
            primary.push_result(Ok(RechargeResult {
                success: false,
                folio: None,
                trans_id: None,
                final_balance: None,
                carrier: None,
                timeout_observed_ms: Some(5000),
                ip: None,
                raw: serde_json::json!({}),
                error: Some(ProviderErrorPayload {
                    message: "no response".into(),
                    code: Some("TIMEOUT".into()),
                    http_status: None,
                }),
            }));
        }

        let secondary = MockProviderClient::new("secondary", Decimal::new(10000, 2));
        secondary.push_result(Ok(RechargeResult {
            success: true,
            folio: Some("F2".into()),
            trans_id: Some("T2".into()),
            final_balance: Some(Decimal::new(5000, 2)),
            carrier: Some("telcel".into()),
            timeout_observed_ms: Some(110),
            ip: Some("10.0.0.2".into()),
            raw: serde_json::json!({}),
            error: None,
        }));

        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/does-not-exist").unwrap();
        let writer = SettlementWriter::new(pool);

        let worker = PipelineWorker {
            service: ServiceKind::Gps,
            lock: &lock,
            queue: &queue,
            selector: &selector,
            providers: vec![&primary, &secondary],
            writer: &writer,
            retry_policy: RetryPolicy::default(),
            lock_ttl: Duration::from_secs(60),
            inter_call_delay: Duration::ZERO,
            minutes_threshold: 10,
            activity_cap_days: 14,
            revalidation_window_days: 6,
            timezone: chrono_tz::America::Mazatlan,
            actor: "keeper".into(),
        };

        let summary = worker.run_tick(Utc::now()).await.unwrap();
        assert_eq!(summary.successes, 1);
        let remaining = queue.snapshot().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].provider_name, "secondary");
        assert_eq!(remaining[0].folio.as_deref(), Some("F2"));
    }
}
