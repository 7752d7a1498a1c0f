//! Audit Log Entry
//!
//! Defines the ledger row, the producer-facing event, and the frozen
//! canonical encoding (`audit-chain/v1`) that every chain digest is computed
//! from. Changing anything in `canonical_bytes` invalidates all historical
//! verification, so new encodings must ship under a new protocol tag.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::audit::sensitivity::is_sensitive_action;
use crate::error::{AuditError, AuditResult};

/// Protocol tag mixed into every canonical encoding.
pub const PROTOCOL_VERSION: &str = "audit-chain/v1";

/// Predecessor digest of entry 1.
pub const GENESIS_DIGEST: &str =
    "sha256:0000000000000000000000000000000000000000000000000000000000000000";

const DIGEST_PREFIX: &str = "sha256:";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// An audited action as submitted by a producer. Everything except the
/// store-assigned `id`, `created_at`, `immutable` and `chain_digest`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub actor_id: String,
    pub actor_name: String,
    pub action: String,
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    /// Opaque change description, captured verbatim and never re-serialized.
    #[serde(default)]
    pub changes: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub is_sensitive: bool,
}

impl AuditEvent {
    pub fn new(
        actor_id: impl Into<String>,
        actor_name: impl Into<String>,
        action: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            actor_name: actor_name.into(),
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: None,
            summary: None,
            changes: String::new(),
            ip_address: None,
            is_sensitive: false,
        }
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_changes(mut self, changes: impl Into<String>) -> Self {
        self.changes = changes.into();
        self
    }

    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.is_sensitive = true;
        self
    }

    pub fn validate(&self) -> AuditResult<()> {
        if self.actor_id.trim().is_empty() {
            return Err(AuditError::Validation("actorId is required".to_string()));
        }
        if self.action.trim().is_empty() {
            return Err(AuditError::Validation("action is required".to_string()));
        }
        if self.entity_type.trim().is_empty() {
            return Err(AuditError::Validation("entityType is required".to_string()));
        }
        Ok(())
    }

    /// Raise the sensitivity flag for actions the classifier treats as sensitive.
    /// A producer-supplied `true` is never lowered.
    pub fn classified(mut self) -> Self {
        if !self.is_sensitive {
            self.is_sensitive = is_sensitive_action(&self.action, Some(&self.entity_type));
        }
        self
    }
}

/// Immutable ledger row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: i64,
    pub actor_id: String,
    pub actor_name: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub summary: Option<String>,
    pub changes: String,
    pub ip_address: Option<String>,
    pub is_sensitive: bool,
    pub created_at: DateTime<Utc>,
    pub immutable: bool,
    pub chain_digest: String,
}

impl LogEntry {
    /// Build the entry for `id` and chain it onto `previous_digest`.
    pub fn chained(
        id: i64,
        event: AuditEvent,
        created_at: DateTime<Utc>,
        previous_digest: &str,
    ) -> Self {
        let mut entry = Self {
            id,
            actor_id: event.actor_id,
            actor_name: event.actor_name,
            action: event.action,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            summary: event.summary,
            changes: event.changes,
            ip_address: event.ip_address,
            is_sensitive: event.is_sensitive,
            created_at: normalize_timestamp(created_at),
            immutable: true,
            chain_digest: String::new(),
        };
        entry.chain_digest = entry.compute_digest(previous_digest);
        entry
    }

    /// Canonical byte encoding of the entry content (everything but `chain_digest`).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.changes.len());
        out.extend_from_slice(PROTOCOL_VERSION.as_bytes());
        out.push(0x00);
        out.extend_from_slice(&self.id.to_be_bytes());
        put_bytes(&mut out, format_timestamp(&self.created_at).as_bytes());
        put_bytes(&mut out, self.actor_id.as_bytes());
        put_bytes(&mut out, self.actor_name.as_bytes());
        put_bytes(&mut out, self.action.as_bytes());
        put_bytes(&mut out, self.entity_type.as_bytes());
        put_optional(&mut out, self.entity_id.as_deref());
        put_optional(&mut out, self.summary.as_deref());
        put_bytes(&mut out, self.changes.as_bytes());
        put_optional(&mut out, self.ip_address.as_deref());
        out.push(self.is_sensitive as u8);
        out.push(self.immutable as u8);
        out
    }

    /// `Hash(canonical ‖ previous_digest)`
    pub fn compute_digest(&self, previous_digest: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        hasher.update(previous_digest.as_bytes());
        format!("{}{}", DIGEST_PREFIX, hex::encode(hasher.finalize()))
    }

    /// Whether the stored digest matches the content chained onto `previous_digest`.
    pub fn verify_digest(&self, previous_digest: &str) -> bool {
        self.chain_digest == self.compute_digest(previous_digest)
    }
}

/// 8-byte big-endian length followed by the bytes.
fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// `0x00` for absent, `0x01` + length-prefixed bytes for present.
fn put_optional(out: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(v) => {
            out.push(0x01);
            put_bytes(out, v.as_bytes());
        }
        None => out.push(0x00),
    }
}

/// Truncate to the microsecond precision the canonical form carries.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// Fixed-width RFC 3339 form used both in storage and in the canonical encoding.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> AuditResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AuditError::Storage(format!("Invalid stored timestamp {:?}: {}", raw, e)))
}

pub fn is_well_formed_digest(digest: &str) -> bool {
    digest
        .strip_prefix(DIGEST_PREFIX)
        .map(|hex_part| hex_part.len() == 64 && hex_part.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or(false)
}
