//! Query-string and body parsing for the HTTP handlers.
//!
//! Parameters arrive as strings and are parsed here so malformed input
//! surfaces as `AuditError::Validation` (400) with a readable message.

use axum::http::HeaderMap;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;

use crate::audit::archive::ArchiveCutoff;
use crate::audit::export::ExportActor;
use crate::audit::query::{EntryFilter, DEFAULT_PAGE_SIZE};
use crate::error::{AuditError, AuditResult};

const ACTOR_ID_HEADER: &str = "x-actor-id";
const ACTOR_NAME_HEADER: &str = "x-actor-name";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyChainParams {
    pub start_id: Option<String>,
    pub end_id: Option<String>,
}

impl VerifyChainParams {
    pub fn bounds(&self) -> AuditResult<(Option<i64>, Option<i64>)> {
        let start = optional(&self.start_id).map(|raw| parse_id("startId", raw)).transpose()?;
        let end = optional(&self.end_id).map(|raw| parse_id("endId", raw)).transpose()?;
        Ok((start, end))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub is_sensitive: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_id: Option<String>,
    pub action: Option<String>,
    pub keyword: Option<String>,
}

impl FilterParams {
    pub fn to_filter(&self) -> AuditResult<EntryFilter> {
        let is_sensitive = match optional(&self.is_sensitive) {
            Some("true") | Some("1") => Some(true),
            Some("false") | Some("0") => Some(false),
            Some(other) => {
                return Err(AuditError::Validation(format!(
                    "Invalid isSensitive value: {}",
                    other
                )))
            }
            None => None,
        };

        let filter = EntryFilter {
            start_date: optional(&self.start_date)
                .map(|raw| parse_date("startDate", raw, NaiveTime::MIN))
                .transpose()?,
            end_date: optional(&self.end_date)
                .map(|raw| parse_date("endDate", raw, end_of_day()))
                .transpose()?,
            is_sensitive,
            entity_type: optional(&self.entity_type).map(str::to_string),
            entity_id: optional(&self.entity_id).map(str::to_string),
            actor_id: optional(&self.actor_id).map(str::to_string),
            action: optional(&self.action).map(str::to_string),
            keyword: optional(&self.keyword).map(str::to_string),
        };
        filter.validate()?;
        Ok(filter)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub page: Option<String>,
    pub limit: Option<String>,
    #[serde(flatten)]
    pub filter: FilterParams,
}

impl ListParams {
    /// `(page, limit)`; out-of-range values are clamped by the query service.
    pub fn paging(&self) -> AuditResult<(u32, u32)> {
        let page = optional(&self.page)
            .map(|raw| parse_number("page", raw))
            .transpose()?
            .unwrap_or(1);
        let limit = optional(&self.limit)
            .map(|raw| parse_number("limit", raw))
            .transpose()?
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Ok((page, limit))
    }
}

/// Body of `POST /archive`. At most one cutoff; none means the configured retention.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRequest {
    pub before_id: Option<i64>,
    pub before_date: Option<String>,
    pub retention_days: Option<i64>,
}

impl ArchiveRequest {
    pub fn cutoff(&self, default_retention_days: i64, now: DateTime<Utc>) -> AuditResult<ArchiveCutoff> {
        let given = [
            self.before_id.is_some(),
            self.before_date.is_some(),
            self.retention_days.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if given > 1 {
            return Err(AuditError::Validation(
                "Specify only one of beforeId, beforeDate or retentionDays".to_string(),
            ));
        }

        if let Some(id) = self.before_id {
            if id < 1 {
                return Err(AuditError::invalid_id(id));
            }
            return Ok(ArchiveCutoff::Id(id));
        }
        if let Some(raw) = &self.before_date {
            return Ok(ArchiveCutoff::Date(parse_date("beforeDate", raw, end_of_day())?));
        }
        let days = self.retention_days.unwrap_or(default_retention_days);
        if days < 0 {
            return Err(AuditError::Validation(format!(
                "retentionDays cannot be negative: {}",
                days
            )));
        }
        Ok(ArchiveCutoff::retention(days, now))
    }
}

/// Requesting actor from `x-actor-id` / `x-actor-name`, defaulting to `system`.
pub fn actor_from_headers(headers: &HeaderMap) -> ExportActor {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let id = header(ACTOR_ID_HEADER).unwrap_or_else(|| "system".to_string());
    let name = header(ACTOR_NAME_HEADER).unwrap_or_else(|| id.clone());
    let ip_address = header(FORWARDED_FOR_HEADER)
        .and_then(|list| list.split(',').next().map(|ip| ip.trim().to_string()));

    ExportActor {
        id,
        name,
        ip_address,
    }
}

fn optional(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub fn parse_id(name: &str, raw: &str) -> AuditResult<i64> {
    let id: i64 = raw
        .parse()
        .map_err(|_| AuditError::Validation(format!("Invalid {}: {:?} is not an integer", name, raw)))?;
    if id < 1 {
        return Err(AuditError::invalid_id(id));
    }
    Ok(id)
}

fn parse_number(name: &str, raw: &str) -> AuditResult<u32> {
    raw.parse()
        .map_err(|_| AuditError::Validation(format!("Invalid {}: {:?}", name, raw)))
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap_or(NaiveTime::MIN)
}

/// RFC 3339 timestamp, or a bare `YYYY-MM-DD` taken at `time_of_day`.
fn parse_date(name: &str, raw: &str, time_of_day: NaiveTime) -> AuditResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|date| date.and_time(time_of_day).and_utc())
        .map_err(|_| AuditError::Validation(format!("Invalid {}: {:?}", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_verify_chain_bounds() {
        let params = VerifyChainParams {
            start_id: Some("4".into()),
            end_id: None,
        };
        assert_eq!(params.bounds().unwrap(), (Some(4), None));

        let bad = VerifyChainParams {
            start_id: Some("abc".into()),
            end_id: None,
        };
        assert!(matches!(bad.bounds(), Err(AuditError::Validation(_))));

        let zero = VerifyChainParams {
            start_id: None,
            end_id: Some("0".into()),
        };
        assert!(matches!(zero.bounds(), Err(AuditError::Validation(_))));
    }

    #[test]
    fn test_filter_dates() {
        let params = FilterParams {
            start_date: Some("2024-01-01".into()),
            end_date: Some("2024-01-31".into()),
            is_sensitive: Some("true".into()),
            ..Default::default()
        };
        let filter = params.to_filter().unwrap();
        assert_eq!(
            filter.end_date.unwrap().to_rfc3339(),
            "2024-01-31T23:59:59.999999+00:00"
        );
        assert_eq!(filter.is_sensitive, Some(true));

        let inverted = FilterParams {
            start_date: Some("2024-02-01".into()),
            end_date: Some("2024-01-01".into()),
            ..Default::default()
        };
        assert!(inverted.to_filter().is_err());
    }

    #[test]
    fn test_archive_request_single_cutoff() {
        let now = Utc::now();
        let both = ArchiveRequest {
            before_id: Some(5),
            retention_days: Some(30),
            ..Default::default()
        };
        assert!(both.cutoff(365, now).is_err());

        let by_id = ArchiveRequest {
            before_id: Some(5),
            ..Default::default()
        };
        assert_eq!(by_id.cutoff(365, now).unwrap(), ArchiveCutoff::Id(5));

        let default = ArchiveRequest::default();
        assert_eq!(default.cutoff(365, now).unwrap(), ArchiveCutoff::retention(365, now));
    }

    #[test]
    fn test_actor_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(actor_from_headers(&headers).id, "system");

        headers.insert(ACTOR_ID_HEADER, HeaderValue::from_static("u-7"));
        headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        let actor = actor_from_headers(&headers);
        assert_eq!(actor.id, "u-7");
        assert_eq!(actor.name, "u-7");
        assert_eq!(actor.ip_address.as_deref(), Some("10.0.0.1"));
    }
}
