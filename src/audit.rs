use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use ulid::Ulid;

use crate::auth::{AuthContext, Role};

/// Whether the audited operation went through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AuditOutcome {
    Ok,
    Failed(String),
}

/// One audit-trail entry: who did what to which entity, and how it ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub id: Ulid,
    pub actor: Ulid,
    pub role: Role,
    pub action: &'static str,
    pub entity_id: Ulid,
    pub detail: String,
    pub outcome: AuditOutcome,
    pub at: DateTime<Utc>,
}

/// Audit sink: every state-mutating operation lands here, and override
/// actions land here even when they fail. Records are kept queryable
/// in-process and mirrored as structured log events under target `audit`;
/// long-term archival is the embedding service's concern.
pub struct AuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self { records: Mutex::new(Vec::new()) }
    }

    pub fn record(
        &self,
        ctx: &AuthContext,
        action: &'static str,
        entity_id: Ulid,
        detail: impl Into<String>,
        outcome: AuditOutcome,
    ) {
        let record = AuditRecord {
            id: Ulid::new(),
            actor: ctx.user_id,
            role: ctx.role,
            action,
            entity_id,
            detail: detail.into(),
            outcome: outcome.clone(),
            at: Utc::now(),
        };
        tracing::info!(
            target: "audit",
            actor = %record.actor,
            role = ?record.role,
            action,
            entity = %entity_id,
            detail = %record.detail,
            outcome = ?outcome,
        );
        self.records.lock().expect("audit lock poisoned").push(record);
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().expect("audit lock poisoned").clone()
    }

    pub fn records_for(&self, entity_id: Ulid) -> Vec<AuditRecord> {
        self.records
            .lock()
            .expect("audit lock poisoned")
            .iter()
            .filter(|r| r.entity_id == entity_id)
            .cloned()
            .collect()
    }
}
