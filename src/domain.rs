use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of billable services. Never model this as a string-keyed map (Design Note).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Gps,
    Voz,
    Eliot,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [ServiceKind::Gps, ServiceKind::Voz, ServiceKind::Eliot];

    /// Lock key namespace, e.g. `recharge_gps` (spec §4.2).
    pub fn lock_key(self) -> &'static str {
        match self {
            ServiceKind::Gps => "recharge_gps",
            ServiceKind::Voz => "recharge_voz",
            ServiceKind::Eliot => "recharge_eliot",
        }
    }

    /// Wire-level service-type tag for the Settlement master row (spec §4.10).
    pub fn settlement_tag(self) -> &'static str {
        match self {
            ServiceKind::Gps => "rastreo",
            ServiceKind::Voz => "paquete",
            ServiceKind::Eliot => "eliot",
        }
    }

    pub fn queue_file_stem(self) -> &'static str {
        match self {
            ServiceKind::Gps => "gps",
            ServiceKind::Voz => "voz",
            ServiceKind::Eliot => "eliot",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.queue_file_stem())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub sim: String,
    pub service: ServiceKind,
    pub description: String,
    pub company: String,
    pub hardware_id: String,
    pub device_id: i64,
    pub expiry: Option<DateTime<Utc>>,
    pub last_report: Option<DateTime<Utc>>,
    pub active: bool,
    pub company_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryState {
    Expired,
    ExpiringToday,
    Future,
}

#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub balance: Decimal,
}

/// Transient per-tick record (spec §3). Never persisted.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub device: Device,
    pub minutes_since_last_report: Option<i64>,
    pub days_since_last_report: Option<i64>,
    pub expiry_state: ExpiryState,
    pub unit_amount: Decimal,
    pub days_of_validity: i64,
    pub product_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    WebserviceSuccessPendingDb,
    DbInsertionFailedPendingRecovery,
    DbVerificationFailed,
}

/// Normalized result of a `ProviderClient::recharge` call (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RechargeResult {
    pub success: bool,
    pub folio: Option<String>,
    pub trans_id: Option<String>,
    pub final_balance: Option<Decimal>,
    pub carrier: Option<String>,
    pub timeout_observed_ms: Option<u64>,
    pub ip: Option<String>,
    pub raw: serde_json::Value,
    pub error: Option<ProviderErrorPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderErrorPayload {
    pub message: String,
    pub code: Option<String>,
    pub http_status: Option<u16>,
}

/// Note-context used to render the human-readable detail line (spec §4.8 step 6, §4.10 step 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteContext {
    pub current_index: usize,
    pub total_to_recharge: usize,
    pub grace_count: usize,
    pub total_candidates: usize,
}

/// The auxiliary-queue element: durable proof a provider charge happened (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecharge {
    pub id: Uuid,
    pub service: ServiceKind,
    pub sim: String,
    pub provider_name: String,
    pub unit_amount: Decimal,
    pub days_of_validity: i64,
    pub folio: Option<String>,
    pub trans_id: Option<String>,
    pub final_balance: Option<Decimal>,
    pub minutes_since_last_report: Option<i64>,
    pub raw: serde_json::Value,
    pub device: Device,
    pub note_context: NoteContext,
    pub status: PendingStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_touched_at: DateTime<Utc>,
}

impl PendingRecharge {
    pub fn mark_attempt(&mut self, status: PendingStatus, now: DateTime<Utc>) {
        self.status = status;
        self.attempts = self.attempts.saturating_add(1);
        self.last_touched_at = now;
    }
}

/// System-of-record Settlement (spec §3).
#[derive(Debug, Clone)]
pub struct SettlementMaster {
    pub total: Decimal,
    pub timestamp_unix: i64,
    pub human_note: String,
    pub actor: String,
    pub provider_name: String,
    pub service_type_tag: &'static str,
    pub summary_counters: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct SettlementDetail {
    pub sim: String,
    pub unit_amount: Decimal,
    pub device_id: i64,
    pub vehicle_company_label: String,
    pub detail_text: String,
    pub folio: Option<String>,
    pub status: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ClassificationCounts {
    pub recharge: usize,
    pub grace: usize,
    pub stable: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_and_tags_are_closed_and_stable() {
        assert_eq!(ServiceKind::Gps.lock_key(), "recharge_gps");
        assert_eq!(ServiceKind::Voz.settlement_tag(), "paquete");
        assert_eq!(ServiceKind::Eliot.settlement_tag(), "eliot");
        assert_eq!(ServiceKind::ALL.len(), 3);
    }
}
