//! Job queue public types

use crate::error::FrameworkError;
use serde::{Deserialize, Serialize};

const JOB_ID_PREFIX: &str = "seq_";
const STEP_SEPARATOR: &str = "_step_";

/// Deterministic job identifier for one sequence step
///
/// Built only from `(follow_up_id, rule_id)`, so scheduling the same step
/// twice lands on the same queue row and cancelling never has to know
/// anything but the follow-up id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// `seq_{follow_up_id}_step_{rule_id}`
    pub fn for_step(follow_up_id: i64, rule_id: i64) -> Self {
        Self(format!(
            "{}{}{}{}",
            JOB_ID_PREFIX, follow_up_id, STEP_SEPARATOR, rule_id
        ))
    }

    /// Prefix shared by every step job of one follow-up
    pub fn prefix_for(follow_up_id: i64) -> String {
        format!("{}{}{}", JOB_ID_PREFIX, follow_up_id, STEP_SEPARATOR)
    }

    /// Split an id back into `(follow_up_id, rule_id)`
    pub fn parse(raw: &str) -> Option<(i64, i64)> {
        let rest = raw.strip_prefix(JOB_ID_PREFIX)?;
        let (follow_up_id, rule_id) = rest.split_once(STEP_SEPARATOR)?;
        Some((follow_up_id.parse().ok()?, rule_id.parse().ok()?))
    }

    pub(crate) fn from_raw(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

/// Payload stored with every step job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub follow_up_id: i64,
    pub rule_id: i64,
    pub workspace_id: i64,
}

impl JobPayload {
    /// The id this payload is scheduled under
    pub fn job_id(&self) -> JobId {
        JobId::for_step(self.follow_up_id, self.rule_id)
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A job handed to a worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// Row id in `scheduled_jobs`
    pub id: i64,
    pub job_id: JobId,
    pub payload: String,
    /// Attempt number of this delivery, starting at 1
    pub attempts: i32,
    pub max_attempts: i32,
    /// Worker holding the lease for this delivery
    pub worker_id: String,
}

impl ClaimedJob {
    pub fn payload(&self) -> Result<JobPayload, FrameworkError> {
        serde_json::from_str(&self.payload).map_err(|e| {
            FrameworkError::internal(format!("Job {} payload deserialize error: {}", self.job_id, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn job_id_is_deterministic() {
        let id = JobId::for_step(12, 7);
        assert_eq!(id.as_str(), "seq_12_step_7");
        assert_eq!(id, JobId::for_step(12, 7));
        assert!(id.as_str().starts_with(&JobId::prefix_for(12)));
        assert!(!id.as_str().starts_with(&JobId::prefix_for(1)));
    }

    #[test]
    fn job_id_parses_back() {
        assert_eq!(JobId::parse("seq_12_step_7"), Some((12, 7)));
        assert_eq!(JobId::parse("seq_12_step_"), None);
        assert_eq!(JobId::parse("other_12_step_7"), None);
    }

    #[test]
    fn payload_uses_camel_case_keys() {
        let payload = JobPayload {
            follow_up_id: 1,
            rule_id: 2,
            workspace_id: 3,
        };
        let json = serde_json::to_value(payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"followUpId": 1, "ruleId": 2, "workspaceId": 3})
        );
        assert_eq!(payload.job_id(), JobId::for_step(1, 2));
    }
}
