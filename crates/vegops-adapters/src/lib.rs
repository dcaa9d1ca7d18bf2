//! Work-management API boundary: raw record contracts, the fetch interface,
//! and the raw-record transformer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use vegops_core::{CircuitDraft, PermissionStatus, WorkUnit};

pub const CRATE_NAME: &str = "vegops-adapters";

/// Raw work-order payload as the external API returns it. Everything beyond
/// the job GUID is optional at the wire level; the transformer decides what
/// is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawWorkOrderRecord {
    pub job_guid: String,
    #[serde(default)]
    pub work_order: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub pct_complete: Option<f64>,
    #[serde(default)]
    pub total_miles: Option<f64>,
    #[serde(default)]
    pub planned_miles: Option<f64>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub units: Vec<RawUnitEntry>,
}

/// Raw work-unit entry nested under a work order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawUnitEntry {
    #[serde(default)]
    pub unit_guid: Option<String>,
    #[serde(default)]
    pub unit_type: Option<String>,
    #[serde(default)]
    pub qty: Option<f64>,
    #[serde(default)]
    pub uom: Option<String>,
    #[serde(default)]
    pub permission: Option<String>,
    #[serde(default)]
    pub planned_by: Option<String>,
}

/// Scope of a fetch: status filters or explicit entity ids. Empty filters
/// mean "everything the source will give us".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchFilters {
    pub statuses: Vec<String>,
    pub external_ids: Vec<String>,
}

impl FetchFilters {
    pub fn by_statuses(statuses: &[&str]) -> Self {
        Self {
            statuses: statuses.iter().map(ToString::to_string).collect(),
            external_ids: Vec::new(),
        }
    }

    pub fn by_ids(ids: &[&str]) -> Self {
        Self {
            statuses: Vec::new(),
            external_ids: ids.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("work-management source unreachable: {0}")]
    Unreachable(String),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

/// Opaque fetch interface over the external work-management API.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Cheap reachability probe; a failure here aborts the whole run.
    async fn health_check(&self) -> Result<(), SourceError>;

    /// Fetches the work orders matching the given scope.
    async fn fetch_work_orders(
        &self,
        filters: &FetchFilters,
    ) -> Result<Vec<RawWorkOrderRecord>, SourceError>;

    /// Fetches the current raw unit records for one work order.
    async fn fetch_work_units(&self, external_id: &str)
        -> Result<Vec<RawUnitEntry>, SourceError>;
}

/// Per-record validation failure. Treated as non-fatal by the orchestrator.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("record {record}: missing required field `{field}`")]
    MissingField { record: String, field: &'static str },
    #[error("record {record}: {message}")]
    Invalid { record: String, message: String },
}

/// Normalizes one raw work-order payload into the typed draft the pipeline
/// consumes, separating always-synced from user-overridable fields.
pub fn transform_work_order(raw: &RawWorkOrderRecord) -> Result<CircuitDraft, TransformError> {
    let record = raw.job_guid.clone();
    if record.trim().is_empty() {
        return Err(TransformError::MissingField {
            record: "<unknown>".into(),
            field: "job_guid",
        });
    }
    let work_order_code = raw
        .work_order
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(TransformError::MissingField {
            record: record.clone(),
            field: "work_order",
        })?
        .to_string();
    let status_code = raw
        .status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(TransformError::MissingField {
            record: record.clone(),
            field: "status",
        })?
        .to_string();

    let percent_complete = raw.pct_complete.unwrap_or(0.0);
    if !(0.0..=100.0).contains(&percent_complete) {
        return Err(TransformError::Invalid {
            record,
            message: format!("pct_complete {percent_complete} out of range"),
        });
    }

    Ok(CircuitDraft {
        external_id: raw.job_guid.trim().to_string(),
        work_order_code,
        region: raw
            .region
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("UNASSIGNED")
            .to_string(),
        status_code,
        percent_complete,
        total_miles: raw.total_miles.unwrap_or(0.0),
        miles_planned: raw.planned_miles,
        assigned_to: raw
            .assigned_to
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string),
    })
}

/// Normalizes the raw unit entries for a circuit. Entries with no unit type
/// are dropped with a warning rather than failing the record.
pub fn transform_work_units(
    circuit_external_id: &str,
    entries: &[RawUnitEntry],
) -> Vec<WorkUnit> {
    entries
        .iter()
        .enumerate()
        .filter_map(|(idx, entry)| {
            let type_code = entry
                .unit_type
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())?
                .to_string();
            let external_id = entry
                .unit_guid
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("{circuit_external_id}#{idx}"));
            Some(WorkUnit {
                external_id,
                circuit_external_id: circuit_external_id.to_string(),
                type_code,
                quantity: entry.qty.unwrap_or(0.0),
                unit_of_measure: entry
                    .uom
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or("")
                    .to_ascii_uppercase(),
                permission_status: entry
                    .permission
                    .as_deref()
                    .map(PermissionStatus::from_code)
                    .unwrap_or(PermissionStatus::Pending),
                planned_by: entry
                    .planned_by
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn retry_disposition_for_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn retry_disposition_for_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Cooperative rate budget: after every `calls_before_delay` source calls,
/// pause for `delay` before continuing. This is self-imposed pacing, not a
/// hard external throttle.
#[derive(Debug)]
pub struct CallBudget {
    calls_before_delay: u32,
    delay: Duration,
    calls: AtomicU32,
}

impl CallBudget {
    pub fn new(calls_before_delay: u32, delay: Duration) -> Self {
        Self {
            calls_before_delay,
            delay,
            calls: AtomicU32::new(0),
        }
    }

    /// Records one source call, sleeping when the window fills.
    pub async fn tick(&self) {
        if self.calls_before_delay == 0 {
            return;
        }
        let made = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if made % self.calls_before_delay == 0 {
            debug!(calls = made, delay_ms = self.delay.as_millis() as u64, "rate budget pause");
            tokio::time::sleep(self.delay).await;
        }
    }

    pub fn calls_made(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            api_token: None,
            timeout: Duration::from_secs(20),
            user_agent: "vegops-sync/0.1".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP-backed [`WorkSource`] with bounded retry on transient failures.
#[derive(Debug)]
pub struct HttpWorkSource {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpWorkSource {
    pub fn new(config: HttpSourceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
            backoff: config.backoff,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, SourceError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(&url);
            if let Some(token) = &self.api_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<T>()
                            .await
                            .map_err(|err| SourceError::Decode(err.to_string()));
                    }
                    if retry_disposition_for_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%url, status = status.as_u16(), attempt, "retrying source call");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if retry_disposition_for_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        Err(match last_request_error {
            Some(err) => SourceError::Request(err),
            None => SourceError::Unreachable(url),
        })
    }
}

#[async_trait]
impl WorkSource for HttpWorkSource {
    async fn health_check(&self) -> Result<(), SourceError> {
        let url = format!("{}/ping", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        let resp = request
            .send()
            .await
            .map_err(|err| SourceError::Unreachable(err.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SourceError::Unreachable(format!(
                "{url} returned {}",
                resp.status()
            )))
        }
    }

    async fn fetch_work_orders(
        &self,
        filters: &FetchFilters,
    ) -> Result<Vec<RawWorkOrderRecord>, SourceError> {
        let mut query = Vec::new();
        if !filters.statuses.is_empty() {
            query.push(format!("status={}", filters.statuses.join(",")));
        }
        if !filters.external_ids.is_empty() {
            query.push(format!("ids={}", filters.external_ids.join(",")));
        }
        let path = if query.is_empty() {
            "workorders".to_string()
        } else {
            format!("workorders?{}", query.join("&"))
        };
        self.get_json(&path).await
    }

    async fn fetch_work_units(
        &self,
        external_id: &str,
    ) -> Result<Vec<RawUnitEntry>, SourceError> {
        self.get_json(&format!("workorders/{external_id}/units")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_record() -> RawWorkOrderRecord {
        RawWorkOrderRecord {
            job_guid: "JOB-001".into(),
            work_order: Some("WO-1001".into()),
            region: Some("NORTH".into()),
            status: Some("ACTIV".into()),
            pct_complete: Some(40.0),
            total_miles: Some(12.5),
            planned_miles: Some(5.0),
            assigned_to: Some("pat".into()),
            units: vec![],
        }
    }

    #[test]
    fn transform_populates_all_draft_fields() {
        let draft = transform_work_order(&raw_record()).unwrap();
        assert_eq!(draft.external_id, "JOB-001");
        assert_eq!(draft.work_order_code, "WO-1001");
        assert_eq!(draft.region, "NORTH");
        assert_eq!(draft.status_code, "ACTIV");
        assert_eq!(draft.miles_planned, Some(5.0));
    }

    #[test]
    fn transform_rejects_missing_work_order() {
        let mut raw = raw_record();
        raw.work_order = Some("   ".into());
        let err = transform_work_order(&raw).unwrap_err();
        assert!(matches!(
            err,
            TransformError::MissingField { field: "work_order", .. }
        ));
    }

    #[test]
    fn transform_rejects_out_of_range_percent() {
        let mut raw = raw_record();
        raw.pct_complete = Some(140.0);
        assert!(matches!(
            transform_work_order(&raw).unwrap_err(),
            TransformError::Invalid { .. }
        ));
    }

    #[test]
    fn transform_defaults_region_and_zeroes_numerics() {
        let mut raw = raw_record();
        raw.region = None;
        raw.total_miles = None;
        raw.planned_miles = None;
        let draft = transform_work_order(&raw).unwrap();
        assert_eq!(draft.region, "UNASSIGNED");
        assert_eq!(draft.total_miles, 0.0);
        assert_eq!(draft.miles_planned, None);
    }

    #[test]
    fn unit_entries_without_a_type_are_dropped() {
        let entries = vec![
            RawUnitEntry {
                unit_guid: Some("U-1".into()),
                unit_type: Some("TRIM".into()),
                qty: Some(150.0),
                uom: Some("lf".into()),
                permission: Some("APPROVED".into()),
                planned_by: Some("pat".into()),
            },
            RawUnitEntry::default(),
        ];
        let units = transform_work_units("JOB-001", &entries);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].unit_of_measure, "LF");
        assert_eq!(units[0].permission_status, PermissionStatus::Approved);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn call_budget_counts_every_call() {
        let budget = CallBudget::new(3, Duration::from_millis(0));
        for _ in 0..7 {
            budget.tick().await;
        }
        assert_eq!(budget.calls_made(), 7);
    }

    #[tokio::test]
    async fn zero_window_disables_the_budget() {
        let budget = CallBudget::new(0, Duration::from_secs(60));
        // Must return immediately even with a long configured delay.
        budget.tick().await;
        assert_eq!(budget.calls_made(), 0);
    }
}
