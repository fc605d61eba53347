use crate::domain::{ProviderErrorPayload, RechargeResult};
use crate::errors::ErrorCategory;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;

/// Uniform interface over recharge providers (spec §4.4).
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &str;
    async fn balance(&self) -> eyre::Result<Decimal>;
    async fn recharge(&self, sim: &str, product_code: &str) -> eyre::Result<RechargeResult>;
}

/// Classify a `RechargeResult`'s error (when present) into a retry category.
/// Timeouts without a response are ambiguous and MUST be RETRIABLE (spec §4.4) — the Pipeline
/// must not assume a timed-out call succeeded just because a retry-worthy category was chosen.
pub fn categorize(result: &RechargeResult) -> Option<ErrorCategory> {
    let err = result.error.as_ref()?;
    if let Some(status) = err.http_status {
        return Some(ErrorCategory::from_http_status(status));
    }
    match err.code.as_deref() {
        Some("TIMEOUT") | Some("CONNECTION_REFUSED") | Some("DNS_FAIL") => {
            Some(ErrorCategory::Retriable)
        }
        Some("INVALID_SIM") | Some("SERVICE_UNAVAILABLE") | Some("INSUFFICIENT_BALANCE") => {
            Some(ErrorCategory::Business)
        }
        Some("RATE_LIMITED") => Some(ErrorCategory::RateLimited),
        _ => Some(ErrorCategory::Retriable),
    }
}

pub struct HttpProviderClient {
    name: String,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpProviderClient {
    pub fn new(name: String, base_url: String, api_key: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a static config");
        Self {
            name,
            base_url,
            api_key,
            http,
            timeout,
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn balance(&self) -> eyre::Result<Decimal> {
        let url = format!("{}/balance", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            eyre::bail!("balance query failed with status {}", status.as_u16());
        }
        #[derive(serde::Deserialize)]
        struct BalanceResponse {
            balance: Decimal,
        }
        let body: BalanceResponse = resp.json().await?;
        Ok(body.balance)
    }

    async fn recharge(&self, sim: &str, product_code: &str) -> eyre::Result<RechargeResult> {
        let url = format!("{}/recharge", self.base_url);
        let started = std::time::Instant::now();
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "sim": sim, "productCode": product_code }))
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                let raw: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
                if status.is_success() {
                    Ok(parse_success(raw, started.elapsed()))
                } else {
                    Ok(RechargeResult {
                        success: false,
                        folio: None,
                        trans_id: None,
                        final_balance: None,
                        carrier: None,
                        timeout_observed_ms: None,
                        ip: None,
                        raw,
                        error: Some(ProviderErrorPayload {
                            message: format!("provider returned status {}", status.as_u16()),
                            code: None,
                            http_status: Some(status.as_u16()),
                        }),
                    })
                }
            }
            Err(err) => Ok(RechargeResult {
                success: false,
                folio: None,
                trans_id: None,
                final_balance: None,
                carrier: None,
                timeout_observed_ms: if err.is_timeout() {
                    Some(self.timeout.as_millis() as u64)
                } else {
                    None
                },
                ip: None,
                raw: serde_json::Value::Null,
                error: Some(ProviderErrorPayload {
                    message: err.to_string(),
                    code: Some(if err.is_timeout() {
                        "TIMEOUT".to_string()
                    } else if err.is_connect() {
                        "CONNECTION_REFUSED".to_string()
                    } else {
                        "UNKNOWN".to_string()
                    }),
                    http_status: None,
                }),
            }),
        }
    }
}

fn parse_success(raw: serde_json::Value, elapsed: Duration) -> RechargeResult {
    RechargeResult {
        success: true,
        folio: raw.get("folio").and_then(|v| v.as_str()).map(str::to_string),
        trans_id: raw.get("transId").and_then(|v| v.as_str()).map(str::to_string),
        final_balance: raw
            .get("finalBalance")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok()),
        carrier: raw.get("carrier").and_then(|v| v.as_str()).map(str::to_string),
        timeout_observed_ms: Some(elapsed.as_millis() as u64),
        ip: raw.get("ip").and_then(|v| v.as_str()).map(str::to_string),
        raw,
        error: None,
    }
}

/// Deterministic in-process double for tests (spec §8 scenarios).
pub struct MockProviderClient {
    pub provider_name: String,
    pub balance_value: std::sync::Mutex<Decimal>,
    pub scripted_results: std::sync::Mutex<std::collections::VecDeque<eyre::Result<RechargeResult>>>,
}

impl MockProviderClient {
    pub fn new(name: &str, balance: Decimal) -> Self {
        Self {
            provider_name: name.to_string(),
            balance_value: std::sync::Mutex::new(balance),
            scripted_results: std::sync::Mutex::new(std::collections::VecDeque::new()),
        }
    }

    pub fn push_result(&self, result: eyre::Result<RechargeResult>) {
        self.scripted_results.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn balance(&self) -> eyre::Result<Decimal> {
        Ok(*self.balance_value.lock().unwrap())
    }

    async fn recharge(&self, _sim: &str, _product_code: &str) -> eyre::Result<RechargeResult> {
        match self.scripted_results.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Err(eyre::eyre!("mock provider exhausted its script")),
        }
    }
}
