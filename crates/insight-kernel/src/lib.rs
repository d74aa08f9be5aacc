use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Group name that grants admin capability.
pub const ADMIN_GROUP: &str = "admins";

/// Context blob the worker hands to the model alongside each prompt.
pub const WORKER_CONTEXT: &str = "Sample customer data from DynamoDB";

pub const CONTACTS_QUERY: &str = "SELECT Id, Name, Email FROM Contact";

const ACCOUNTS_QUERY_PREFIX: &str =
    "SELECT Id, Name, Type, Industry, AnnualRevenue FROM Account WHERE LastModifiedDate >";

/// CRM field carrying per-record type/url metadata; never persisted by the poller.
const CRM_METADATA_FIELD: &str = "attributes";

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

pub fn format_watermark(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn default_watermark(now: DateTime<Utc>, lookback_hours: u32) -> DateTime<Utc> {
    now - Duration::hours(i64::from(lookback_hours))
}

/// Re-renders a stored watermark as a query literal (`YYYY-MM-DDThh:mm:ssZ`).
///
/// Sub-second precision is truncated, which can only widen the window.
pub fn soql_datetime(ts: &str) -> Result<String, String> {
    let parsed = parse_rfc3339(ts.trim())
        .ok_or_else(|| format!("watermark {ts:?} is not an RFC3339 timestamp"))?;
    Ok(parsed.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

pub fn accounts_since_query(watermark: &str) -> Result<String, String> {
    Ok(format!("{ACCOUNTS_QUERY_PREFIX} {}", soql_datetime(watermark)?))
}

/// Drops null-valued fields and the CRM metadata field.
pub fn sanitize_crm_record(record: Map<String, Value>) -> Map<String, Value> {
    record
        .into_iter()
        .filter(|(k, v)| !v.is_null() && k != CRM_METADATA_FIELD)
        .collect()
}

pub fn compose_user_message(prompt: &str, context: &str) -> String {
    format!("{prompt}\n\nDataset: {context}")
}

/// Reads a group-membership claim. Non-string entries are ignored; a bare
/// string is treated as a single group.
pub fn groups_from_claims(claims: &Value, claim: &str) -> Vec<String> {
    match claims.get(claim) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|v| v.to_string())
            .collect(),
        Some(Value::String(group)) => vec![group.clone()],
        _ => Vec::new(),
    }
}

pub fn is_admin(groups: &[String]) -> bool {
    groups.iter().any(|g| g == ADMIN_GROUP)
}

/// Returns the prompt when present and non-empty.
pub fn accept_prompt(prompt: Option<String>) -> Option<String> {
    prompt.filter(|p| !p.is_empty())
}

pub fn synced_message(count: usize, noun: &str) -> String {
    format!("Successfully synced {count} {noun}.")
}
