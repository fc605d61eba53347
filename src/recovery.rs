use crate::domain::{PendingRecharge, PendingStatus, ServiceKind};
use crate::queue::{needs_recovery, QueueStore};
use crate::settlement::SettlementWriter;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct RecoveryOutcome {
    pub drained: bool,
    pub settled: usize,
    pub duplicates: usize,
    pub still_blocked: usize,
}

/// Drain the auxiliary queue at the start of every tick (and at process start): the money has
/// already been spent, so the system refuses to issue new provider calls until the books are
/// reconciled (spec §4.9). This is the strict all-or-nothing recovery gate.
pub async fn run_recovery(
    queue: &dyn QueueStore,
    writer: &SettlementWriter,
    service: ServiceKind,
    actor: &str,
    now: DateTime<Utc>,
    timezone: chrono_tz::Tz,
) -> eyre::Result<RecoveryOutcome> {
    let snapshot = queue.snapshot().await?;
    let pending: Vec<PendingRecharge> = snapshot.into_iter().filter(needs_recovery).collect();

    if pending.is_empty() {
        return Ok(RecoveryOutcome {
            drained: true,
            ..Default::default()
        });
    }

    let outcome = writer
        .settle_batch(service, &pending, actor, now, timezone, true)
        .await;

    let mut result = RecoveryOutcome::default();

    match outcome {
        Ok(batch) => {
            for id in &batch.settled {
                queue.remove(*id).await?;
                result.settled += 1;
            }
            for id in &batch.duplicates {
                queue.remove(*id).await?;
                result.duplicates += 1;
            }
            for id in &batch.unverified {
                let id = *id;
                queue
                    .update(
                        id,
                        Box::new(move |item| {
                            item.mark_attempt(PendingStatus::DbVerificationFailed, now);
                        }),
                    )
                    .await?;
                result.still_blocked += 1;
            }
        }
        Err(err) => {
            tracing::error!(service = %service, error = %err, "recovery settlement failed; items remain queued");
            for item in &pending {
                let id = item.id;
                queue
                    .update(
                        id,
                        Box::new(move |item| {
                            item.mark_attempt(PendingStatus::DbInsertionFailedPendingRecovery, now);
                        }),
                    )
                    .await?;
            }
            result.still_blocked = pending.len();
        }
    }

    result.drained = result.still_blocked == 0;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_is_considered_drained() {
        let outcome = RecoveryOutcome {
            drained: true,
            ..Default::default()
        };
        assert!(outcome.drained);
        assert_eq!(outcome.still_blocked, 0);
    }
}
