use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutEntryRequest {
    pub value: serde_json::Value,
    /// 缺省时使用配置的默认 TTL
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct EntryResponse {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}
