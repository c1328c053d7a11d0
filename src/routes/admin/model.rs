use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::limiter::RateLimitDecision;
use crate::metrics::NamespaceSummary;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub durable_store: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshotResponse {
    pub namespaces: BTreeMap<String, NamespaceSummary>,
}

#[derive(Debug, Deserialize)]
pub struct ReportsQuery {
    /// 起始时间（Unix 毫秒），默认为 24 小时前
    pub since: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatusResponse {
    pub identifier: String,
    #[serde(flatten)]
    pub decision: RateLimitDecision,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub identifier: String,
}
