use crate::domain::{Candidate, ExpiryState};
use chrono::{DateTime, Utc};

/// Per-service classifier thresholds (spec §4.7).
#[derive(Debug, Clone, Copy)]
pub struct ClassifierThresholds {
    pub minutes_threshold: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Recharge,
    Grace,
    Stable,
}

#[derive(Debug, Default)]
pub struct Classified<'a> {
    pub recharge: Vec<&'a Candidate>,
    pub grace: Vec<&'a Candidate>,
    pub stable: Vec<&'a Candidate>,
}

/// Derive the device expiry state relative to `now`/`end_of_today`, both already resolved in the
/// configured operational timezone (spec §3, §4.7).
pub fn expiry_state(
    expiry: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    end_of_today: DateTime<Utc>,
) -> ExpiryState {
    match expiry {
        None => ExpiryState::Future,
        Some(e) if e > end_of_today => ExpiryState::Future,
        Some(e) if e <= now => ExpiryState::Expired,
        Some(_) => ExpiryState::ExpiringToday,
    }
}

/// Classify one candidate (spec §4.7). Pure — no I/O, no hidden clock reads.
pub fn classify_one(candidate: &Candidate, thresholds: ClassifierThresholds) -> Class {
    match candidate.expiry_state {
        ExpiryState::Future => Class::Stable,
        ExpiryState::Expired | ExpiryState::ExpiringToday => {
            let minutes = candidate.minutes_since_last_report.unwrap_or(i64::MAX);
            if minutes >= thresholds.minutes_threshold {
                Class::Recharge
            } else {
                Class::Grace
            }
        }
    }
}

/// Classify a full batch of candidates into three disjoint lists (spec §4.7, property P6).
pub fn classify<'a>(
    candidates: &'a [Candidate],
    thresholds: ClassifierThresholds,
) -> Classified<'a> {
    let mut out = Classified::default();
    for candidate in candidates {
        match classify_one(candidate, thresholds) {
            Class::Recharge => out.recharge.push(candidate),
            Class::Grace => out.grace.push(candidate),
            Class::Stable => out.stable.push(candidate),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Device, ServiceKind};
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;

    fn candidate(minutes: i64, state: ExpiryState) -> Candidate {
        Candidate {
            device: Device {
                sim: "555".into(),
                service: ServiceKind::Gps,
                description: "d".into(),
                company: "c".into(),
                hardware_id: "h".into(),
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

    #[test]
    fn happy_path_gps_scenario() {
        let thresholds = ClassifierThresholds { minutes_threshold: 10 };
        let d1 = candidate(20, ExpiryState::Expired);
        let d2 = candidate(2, ExpiryState::ExpiringToday);
        let d3 = candidate(0, ExpiryState::Future);
        let candidates = [d1, d2, d3];
        let out = classify(&candidates, thresholds);
        assert_eq!(out.recharge.len(), 1);
        assert_eq!(out.grace.len(), 1);
        assert_eq!(out.stable.len(), 1);
    }

    #[test]
    fn minutes_equal_to_threshold_is_inclusive_recharge() {
        let thresholds = ClassifierThresholds { minutes_threshold: 10 };
        let c = candidate(10, ExpiryState::Expired);
        assert_eq!(classify_one(&c, thresholds), Class::Recharge);
    }

    #[test]
    fn every_candidate_lands_in_exactly_one_bucket() {
        let thresholds = ClassifierThresholds { minutes_threshold: 10 };
        let candidates = vec![
            candidate(20, ExpiryState::Expired),
            candidate(2, ExpiryState::ExpiringToday),
            candidate(0, ExpiryState::Future),
            candidate(9, ExpiryState::Expired),
        ];
        let out = classify(&candidates, thresholds);
        assert_eq!(
            out.recharge.len() + out.grace.len() + out.stable.len(),
            candidates.len()
        );
    }

    #[test]
    fn expiry_equal_to_end_of_today_is_expiring_today_not_stable() {
        let now = Utc::now();
        let end_of_today = now + ChronoDuration::hours(2);
        let state = expiry_state(Some(end_of_today), now, end_of_today);
        assert_eq!(state, ExpiryState::ExpiringToday);
    }

    #[test]
    fn grace_saves_money_scenario() {
        let thresholds = ClassifierThresholds { minutes_threshold: 10 };
        let mut candidates = Vec::new();
        for _ in 0..20 {
            candidates.push(candidate(20, ExpiryState::Expired));
        }
        for _ in 0..80 {
            candidates.push(candidate(1, ExpiryState::Expired));
        }
        let out = classify(&candidates, thresholds);
        assert_eq!(out.recharge.len(), 20);
        assert_eq!(out.grace.len(), 80);
    }
}
