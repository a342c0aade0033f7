//! Sequence engine public types

use crate::error::{FrameworkError, HttpError};
use crate::queue::JobId;
use crate::sequence::entities::follow_ups;
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

/// Follow-up lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FollowUpStatus {
    Active,
    Paused,
    Cancelled,
    Completed,
    Converted,
}

impl FollowUpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
            Self::Converted => "CONVERTED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(Self::Active),
            "PAUSED" => Some(Self::Paused),
            "CANCELLED" => Some(Self::Cancelled),
            "COMPLETED" => Some(Self::Completed),
            "CONVERTED" => Some(Self::Converted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Converted)
    }
}

impl fmt::Display for FollowUpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an applied operation did to the follow-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    Paused,
    Resumed,
    Advanced,
    Cancelled,
    Converted,
    Completed,
}

impl Transition {
    /// Event type published to the workspace channel
    pub fn event_kind(&self) -> &'static str {
        match self {
            Self::Started => "follow_up.started",
            Self::Paused => "follow_up.paused",
            Self::Resumed => "follow_up.resumed",
            Self::Advanced => "follow_up.advanced",
            Self::Cancelled => "follow_up.cancelled",
            Self::Converted => "follow_up.converted",
            Self::Completed => "follow_up.completed",
        }
    }
}

/// A stored rule whose delay can't be scheduled
///
/// The operation that hit it still goes through, without a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataIntegrityWarning {
    pub follow_up_id: i64,
    pub rule_id: i64,
    pub delay_ms: i64,
    pub reason: String,
}

impl fmt::Display for DataIntegrityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rule {} has an unusable delay of {}ms ({}); follow-up {} was not scheduled",
            self.rule_id, self.delay_ms, self.reason, self.follow_up_id
        )
    }
}

/// Result of a sequence engine operation
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The follow-up moved
    Applied {
        follow_up: follow_ups::Model,
        transition: Transition,
        /// Job scheduled by this operation
        job_id: Option<JobId>,
        warning: Option<DataIntegrityWarning>,
    },
    /// Cancel or convert on a follow-up that already finished
    AlreadyTerminal { follow_up: follow_ups::Model },
    /// A step callback that no longer matches the follow-up's state
    Skipped { follow_up_id: i64, reason: String },
}

impl Outcome {
    pub fn follow_up(&self) -> Option<&follow_ups::Model> {
        match self {
            Self::Applied { follow_up, .. } | Self::AlreadyTerminal { follow_up } => Some(follow_up),
            Self::Skipped { .. } => None,
        }
    }

    pub fn transition(&self) -> Option<Transition> {
        match self {
            Self::Applied { transition, .. } => Some(*transition),
            _ => None,
        }
    }

    pub fn result_str(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::AlreadyTerminal { .. } => "already_terminal",
            Self::Skipped { .. } => "skipped",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Applied {
                follow_up,
                transition,
                job_id,
                warning,
            } => json!({
                "result": self.result_str(),
                "transition": transition.event_kind(),
                "follow_up": follow_up,
                "job_id": job_id.as_ref().map(JobId::as_str),
                "warning": warning.as_ref().map(ToString::to_string),
            }),
            Self::AlreadyTerminal { follow_up } => json!({
                "result": self.result_str(),
                "follow_up": follow_up,
            }),
            Self::Skipped {
                follow_up_id,
                reason,
            } => json!({
                "result": self.result_str(),
                "follow_up_id": follow_up_id,
                "reason": reason,
            }),
        }
    }
}

/// Sequence engine error
///
/// Everything but `Infrastructure` is an expected business outcome and is
/// never retried.
#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Infrastructure(#[from] FrameworkError),
}

impl SequenceError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

impl From<sea_orm::DbErr> for SequenceError {
    fn from(e: sea_orm::DbErr) -> Self {
        Self::Infrastructure(e.into())
    }
}

impl HttpError for SequenceError {
    fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 422,
            Self::Conflict(_) => 409,
            Self::NotFound(_) => 404,
            Self::Infrastructure(e) => e.status_code(),
        }
    }

    fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Infrastructure(e) => e.error_kind(),
        }
    }
}
