// Session entity: resumable wrapper over runs linked by resume/fork/rewind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::prefixed_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    /// A child session was branched off; this one is frozen
    Forked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    /// Weak reference: the run's lifetime is independent of the session's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_run_id: Option<String>,
    pub status: SessionStatus,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: prefixed_id("ses"),
            parent_session_id: None,
            parent_run_id: None,
            current_run_id: None,
            status: SessionStatus::Active,
            tenant_id: tenant_id.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn child_of(parent: &Session, parent_run_id: impl Into<String>) -> Self {
        let mut session = Session::new(parent.tenant_id.clone());
        session.parent_session_id = Some(parent.id.clone());
        session.parent_run_id = Some(parent_run_id.into());
        session
    }
}
