use crate::error::AppResult;
use crate::system_config::{keys, SystemConfigStore};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use tracing::warn;

/// Resolve the sweep's lower time bound from system configuration.
///
/// Order: an absolute cutoff that parses wins; otherwise `now - max(1, hours)`
/// when an hours value is configured; otherwise no lower bound.
pub async fn resolve_window(
    config: &dyn SystemConfigStore,
    now: DateTime<Utc>,
) -> AppResult<Option<DateTime<Utc>>> {
    if let Some(raw) = config.get_string(keys::BILLING_PROCESS_SINCE_TIME).await? {
        match parse_cutoff(&raw) {
            Some(cutoff) => return Ok(Some(cutoff)),
            // Malformed configuration is absent, not fatal
            None => warn!("ignoring malformed sweep cutoff configuration: {raw}"),
        }
    }

    if let Some(hours) = config.get_int(keys::BILLING_PROCESS_SINCE_HOURS).await? {
        return Ok(Some(now - Duration::hours(hours.max(1))));
    }

    Ok(None)
}

/// Parse an absolute cutoff: RFC 3339 first, then a bare `%Y-%m-%dT%H:%M:%S`
/// date-time read as UTC. Anything else yields None.
pub fn parse_cutoff(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
