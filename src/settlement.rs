use crate::config::end_of_today;
use crate::domain::{NoteContext, PendingRecharge, ServiceKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::fmt::Write as _;

#[derive(Debug, Clone, Default)]
pub struct SettlementOutcome {
    /// Items that committed, verified, and should be removed from the queue.
    pub settled: Vec<uuid::Uuid>,
    /// Items already present under the unique (sim, folio) constraint (absorbed as success).
    pub duplicates: Vec<uuid::Uuid>,
    /// Items that committed but could not be verified; re-marked `db_verification_failed`.
    pub unverified: Vec<uuid::Uuid>,
}

/// Two-phase DB write: master row + detail rows + device expiry update, one transaction per
/// batch (spec §4.10). Idempotent under duplicate folio; never aborts the whole batch for a
/// single duplicate item.
pub struct SettlementWriter {
    pool: PgPool,
}

impl SettlementWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Writes a batch of pending items for one service within a single transaction. On any
    /// non-duplicate failure the whole transaction is rolled back and the caller must mark every
    /// item `db_insertion_failed_pending_recovery` (spec §4.10 failure semantics) — this function
    /// signals that by returning `Err`.
    pub async fn settle_batch(
        &self,
        service: ServiceKind,
        items: &[PendingRecharge],
        actor: &str,
        now: DateTime<Utc>,
        timezone: chrono_tz::Tz,
        is_recovery: bool,
    ) -> eyre::Result<SettlementOutcome> {
        if items.is_empty() {
            return Ok(SettlementOutcome::default());
        }

        let mut tx = self.pool.begin().await?;

        let total: Decimal = items.iter().map(|i| i.unit_amount).sum();
        let note_prefix = if is_recovery { "< RECOVERY > " } else { "" };
        let human_note = format!(
            "{}settlement for {} item(s), service={}",
            note_prefix,
            items.len(),
            service
        );
        let provider_name = items
            .first()
            .map(|i| i.provider_name.clone())
            .unwrap_or_default();
        let summary_counters = serde_json::json!({
            "count": items.len(),
            "service": service.to_string(),
        });

        let master_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO settlement_master
                (total, timestamp_unix, human_note, actor, provider_name, service_type_tag, summary_counters)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(total)
        .bind(now.timestamp())
        .bind(&human_note)
        .bind(actor)
        .bind(&provider_name)
        .bind(service.settlement_tag())
        .bind(summary_counters)
        .fetch_one(&mut *tx)
        .await?;

        let mut duplicates = Vec::new();
        let mut settled = Vec::new();

        for item in items {
            let detail_text = format_detail_text(item);
            let vehicle_label = format!("{} [{}]", item.device.description, item.device.company);

            let insert = sqlx::query(
                r#"
                INSERT INTO settlement_details
                    (master_id, sim, unit_amount, device_id, vehicle_company_label, detail_text, folio, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 1)
                "#,
            )
            .bind(master_id)
            .bind(&item.sim)
            .bind(item.unit_amount)
            .bind(item.device.device_id)
            .bind(&vehicle_label)
            .bind(&detail_text)
            .bind(&item.folio)
            .execute(&mut *tx)
            .await;

            match insert {
                Ok(_) => settled.push(item.id),
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    // Already settled under (sim, folio); absorb as success, do not abort (§4.10 step 2).
                    duplicates.push(item.id);
                }
                Err(other) => return Err(other.into()),
            }

            let new_expiry = end_of_today(now, timezone) + chrono::Duration::hours(24 * item.days_of_validity);
            sqlx::query("UPDATE devices SET unix_saldo = $1 WHERE device_id = $2")
                .bind(new_expiry)
                .bind(item.device.device_id)
                .execute(&mut *tx)
                .await?;
        }

        // Analytics insert is best-effort; its failure must never abort the settlement (spec §9
        // Open Question 3 — the source swallows analytics errors, and this preserves that).
        let analytics = sqlx::query(
            "INSERT INTO settlement_analytics (master_id, counters) VALUES ($1, $2)",
        )
        .bind(master_id)
        .bind(serde_json::json!({ "items": items.len() }))
        .execute(&mut *tx)
        .await;
        if let Err(err) = analytics {
            tracing::warn!(master_id, error = %err, "analytics insert failed; continuing");
        }

        tx.commit().await?;

        let mut outcome = SettlementOutcome {
            settled: Vec::new(),
            duplicates,
            unverified: Vec::new(),
        };

        for id in settled {
            let item = items.iter().find(|i| i.id == id).expect("id came from items");
            if self.verify(&item.sim, item.folio.as_deref(), master_id).await? {
                outcome.settled.push(id);
            } else {
                outcome.unverified.push(id);
            }
        }
        for id in &outcome.duplicates {
            let item = items.iter().find(|i| i.id == *id).expect("id came from items");
            // Duplicates are, by construction, already present — still verify before removal.
            if !self.verify(&item.sim, item.folio.as_deref(), master_id).await? {
                outcome.unverified.push(*id);
            }
        }
        outcome.duplicates.retain(|id| !outcome.unverified.contains(id));

        Ok(outcome)
    }

    async fn verify(&self, sim: &str, folio: Option<&str>, master_id: i64) -> eyre::Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT master_id FROM settlement_details \
             WHERE sim = $1 AND (folio = $2 OR (folio IS NULL AND $2 IS NULL)) AND master_id = $3 \
             LIMIT 1",
        )
        .bind(sim)
        .bind(folio)
        .bind(master_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }
}

/// Single-line detail text; downstream consumers parse this for audit, so field order and
/// labels are part of the external contract (spec §6, §4.10).
fn format_detail_text(item: &PendingRecharge) -> String {
    let mut s = String::new();
    let _ = write!(
        s,
        "saldo={} folio={} monto={} sim={} carrier={} ts={} transId={} timeoutMs={} ip={} minutosSinReportar={}",
        item.final_balance.map(|b| b.to_string()).unwrap_or_else(|| "-".into()),
        item.folio.as_deref().unwrap_or("-"),
        item.unit_amount,
        item.sim,
        item.raw.get("carrier").and_then(|v| v.as_str()).unwrap_or("-"),
        item.created_at.timestamp(),
        item.trans_id.as_deref().unwrap_or("-"),
        item.raw
            .get("timeoutObservedMs")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        item.raw.get("ip").and_then(|v| v.as_str()).unwrap_or("-"),
        item.minutes_since_last_report
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".into()),
    );
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Device, PendingStatus};
    use chrono_tz::America::Mazatlan;
    use uuid::Uuid;

    fn sample_item() -> PendingRecharge {
        PendingRecharge {
            id: Uuid::new_v4(),
            service: ServiceKind::Gps,
            sim: "5551230000".into(),
            provider_name: "p1".into(),
            unit_amount: Decimal::new(1000, 2),
            days_of_validity: 8,
            folio: Some("F1".into()),
            trans_id: Some("T1".into()),
            final_balance: Some(Decimal::new(9000, 2)),
            minutes_since_last_report: Some(45),
            raw: serde_json::json!({"carrier": "telcel", "ip": "10.0.0.1"}),
            device: Device {
                sim: "5551230000".into(),
                service: ServiceKind::Gps,
                description: "unit 1".into(),
                company: "acme".into(),
                hardware_id: "hw1".into(),
                device_id: 1,
                expiry: None,
                last_report: None,
                active: true,
                company_active: true,
            },
            note_context: NoteContext {
                current_index: 0,
                total_to_recharge: 1,
                grace_count: 0,
                total_candidates: 1,
            },
            status: PendingStatus::WebserviceSuccessPendingDb,
            attempts: 0,
            created_at: Utc::now(),
            last_touched_at: Utc::now(),
        }
    }

    #[test]
    fn detail_text_contains_folio_and_sim() {
        let text = format_detail_text(&sample_item());
        assert!(text.contains("folio=F1"));
        assert!(text.contains("sim=5551230000"));
        assert!(text.contains("carrier=telcel"));
        assert!(text.contains("minutosSinReportar=45"));
    }

    #[test]
    fn expiry_never_decreases_relative_to_now() {
        let now = Utc::now();
        let new_expiry = end_of_today(now, Mazatlan) + chrono::Duration::hours(24 * 8);
        assert!(new_expiry > now);
    }
}
