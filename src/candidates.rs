use crate::domain::{Candidate, Device, ExpiryState, ServiceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

/// Service-specific candidate discovery (spec §4.6). One implementation per `ServiceKind`; the
/// set of services is closed (Design Note), so this is three concrete structs, never a map.
#[async_trait]
pub trait CandidateSelector: Send + Sync {
    fn service(&self) -> ServiceKind;
    async fn candidates(
        &self,
        now: DateTime<Utc>,
        end_of_today: DateTime<Utc>,
        activity_cap_days: i64,
        revalidation_window_days: i64,
    ) -> eyre::Result<Vec<Candidate>>;
}

/// Names/descriptions never eligible for recharge (spec §4.6): test fleets, demo units, and
/// operator-specific excluded names.
pub const BLOCKLIST_SUBSTRINGS: [&str; 5] = ["stock", "demo", "_old", "baja", "cancelad"];

pub fn is_blocklisted(name: &str) -> bool {
    let lower = name.to_lowercase();
    BLOCKLIST_SUBSTRINGS.iter().any(|term| lower.contains(term))
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    sim: String,
    description: String,
    company: String,
    hardware_id: String,
    device_id: i64,
    expiry: Option<DateTime<Utc>>,
    last_report: Option<DateTime<Utc>>,
    active: bool,
    company_active: bool,
    unit_amount: Decimal,
    days_of_validity: i32,
    product_code: String,
}

fn to_device(row: &DeviceRow, service: ServiceKind) -> Device {
    Device {
        sim: row.sim.clone(),
        service,
        description: row.description.clone(),
        company: row.company.clone(),
        hardware_id: row.hardware_id.clone(),
        device_id: row.device_id,
        expiry: row.expiry,
        last_report: row.last_report,
        active: row.active,
        company_active: row.company_active,
    }
}

fn minutes_since(last_report: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    last_report.map(|lr| (now - lr).num_minutes().max(0))
}

fn days_since(last_report: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    last_report.map(|lr| (now - lr).num_days().max(0))
}

fn build_candidate(
    row: DeviceRow,
    service: ServiceKind,
    now: DateTime<Utc>,
    end_of_today: DateTime<Utc>,
) -> Candidate {
    let minutes_since_last_report = minutes_since(row.last_report, now);
    let days_since_last_report = days_since(row.last_report, now);
    let expiry = row.expiry;
    let state = if expiry.map(|e| e > end_of_today).unwrap_or(true) {
        ExpiryState::Future
    } else if expiry.map(|e| e <= now).unwrap_or(false) {
        ExpiryState::Expired
    } else {
        ExpiryState::ExpiringToday
    };
    let device = to_device(&row, service);
    Candidate {
        device,
        minutes_since_last_report,
        days_since_last_report,
        expiry_state: state,
        unit_amount: row.unit_amount,
        days_of_validity: row.days_of_validity as i64,
        product_code: row.product_code,
    }
}

pub struct GpsCandidateSelector {
    pool: PgPool,
}

impl GpsCandidateSelector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandidateSelector for GpsCandidateSelector {
    fn service(&self) -> ServiceKind {
        ServiceKind::Gps
    }

    async fn candidates(
        &self,
        now: DateTime<Utc>,
        end_of_today: DateTime<Utc>,
        activity_cap_days: i64,
        revalidation_window_days: i64,
    ) -> eyre::Result<Vec<Candidate>> {
        let rows: Vec<DeviceRow> = sqlx::query_as(
            r#"
            SELECT d.sim, d.description, c.name AS company, d.hardware_id, d.device_id,
                   d.unix_saldo AS expiry, a.last_report, d.active, c.active AS company_active,
                   d.unit_amount, d.days_of_validity, d.product_code
            FROM devices d
            JOIN companies c ON c.id = d.company_id
            LEFT JOIN device_activity a ON a.device_id = d.device_id
            WHERE d.service = 'gps'
              AND d.active
              AND c.active
              AND d.unix_saldo IS NOT NULL
              AND d.unix_saldo <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM settlement_details sd
                  JOIN settlement_master sm ON sm.id = sd.master_id
                  WHERE sd.sim = d.sim
                    AND sm.service_type_tag = 'rastreo'
                    AND sm.timestamp_unix >= $2
              )
            "#,
        )
        .bind(end_of_today)
        .bind(now.timestamp() - revalidation_window_days * 86_400)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|r| !is_blocklisted(&r.description) && !is_blocklisted(&r.company))
            .filter(|r| days_since(r.last_report, now).unwrap_or(0) <= activity_cap_days)
            .map(|r| build_candidate(r, ServiceKind::Gps, now, end_of_today))
            .collect())
    }
}

pub struct VozCandidateSelector {
    pool: PgPool,
}

impl VozCandidateSelector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandidateSelector for VozCandidateSelector {
    fn service(&self) -> ServiceKind {
        ServiceKind::Voz
    }

    /// VOZ has no activity/freshness predicate of its own; it omits minutes/days-since-report
    /// and uses only the expiry predicate (spec §4.6).
    async fn candidates(
        &self,
        now: DateTime<Utc>,
        end_of_today: DateTime<Utc>,
        _activity_cap_days: i64,
        revalidation_window_days: i64,
    ) -> eyre::Result<Vec<Candidate>> {
        let rows: Vec<DeviceRow> = sqlx::query_as(
            r#"
            SELECT d.sim, d.description, c.name AS company, d.hardware_id, d.device_id,
                   d.voz_expiry AS expiry, NULL::timestamptz AS last_report, d.active,
                   c.active AS company_active, d.unit_amount, d.days_of_validity, d.product_code
            FROM devices d
            JOIN companies c ON c.id = d.company_id
            WHERE d.service = 'voz'
              AND d.active
              AND c.active
              AND d.voz_expiry IS NOT NULL
              AND d.voz_expiry <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM settlement_details sd
                  JOIN settlement_master sm ON sm.id = sd.master_id
                  WHERE sd.sim = d.sim
                    AND sm.service_type_tag = 'paquete'
                    AND sm.timestamp_unix >= $2
              )
            "#,
        )
        .bind(end_of_today)
        .bind(now.timestamp() - revalidation_window_days * 86_400)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|r| !is_blocklisted(&r.description) && !is_blocklisted(&r.company))
            .map(|r| build_candidate(r, ServiceKind::Voz, now, end_of_today))
            .collect())
    }
}

pub struct EliotCandidateSelector {
    pool: PgPool,
    metrics: PgPool,
}

impl EliotCandidateSelector {
    pub fn new(pool: PgPool, metrics: PgPool) -> Self {
        Self { pool, metrics }
    }

    /// Bounded freshness lookup against the time-series metrics store; "no metric found" is
    /// treated as "no activity" rather than erroring (spec §4.6).
    async fn last_metric(&self, hardware_id: &str) -> Option<DateTime<Utc>> {
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(3),
            sqlx::query_scalar::<_, DateTime<Utc>>(
                "SELECT observed_at FROM uuid_metrics WHERE uuid = $1 ORDER BY observed_at DESC LIMIT 1",
            )
            .bind(hardware_id)
            .fetch_optional(&self.metrics),
        )
        .await;

        match result {
            Ok(Ok(Some(ts))) => Some(ts),
            Ok(Ok(None)) | Ok(Err(_)) | Err(_) => None,
        }
    }
}

#[async_trait]
impl CandidateSelector for EliotCandidateSelector {
    fn service(&self) -> ServiceKind {
        ServiceKind::Eliot
    }

    async fn candidates(
        &self,
        now: DateTime<Utc>,
        end_of_today: DateTime<Utc>,
        activity_cap_days: i64,
        revalidation_window_days: i64,
    ) -> eyre::Result<Vec<Candidate>> {
        let rows: Vec<DeviceRow> = sqlx::query_as(
            r#"
            SELECT d.sim, d.description, c.name AS company, d.hardware_id, d.device_id,
                   d.unix_saldo AS expiry, NULL::timestamptz AS last_report, d.active,
                   c.active AS company_active, d.unit_amount, d.days_of_validity, d.product_code
            FROM devices d
            JOIN companies c ON c.id = d.company_id
            WHERE d.service = 'eliot'
              AND d.active
              AND c.active
              AND d.unix_saldo IS NOT NULL
              AND d.unix_saldo <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM settlement_details sd
                  JOIN settlement_master sm ON sm.id = sd.master_id
                  WHERE sd.sim = d.sim
                    AND sm.service_type_tag = 'eliot'
                    AND sm.timestamp_unix >= $2
              )
            "#,
        )
        .bind(end_of_today)
        .bind(now.timestamp() - revalidation_window_days * 86_400)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for mut row in rows {
            if is_blocklisted(&row.description) || is_blocklisted(&row.company) {
                continue;
            }
            row.last_report = self.last_metric(&row.hardware_id).await;
            if days_since(row.last_report, now).unwrap_or(0) > activity_cap_days {
                continue;
            }
            candidates.push(build_candidate(row, ServiceKind::Eliot, now, end_of_today));
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocklist_matches_are_case_insensitive() {
        assert!(is_blocklisted("Demo Unit"));
        assert!(is_blocklisted("STOCK-01"));
        assert!(!is_blocklisted("acme fleet"));
    }
}
