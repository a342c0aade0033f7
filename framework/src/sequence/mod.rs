//! Follow-up sequences
//!
//! A workspace configures an ordered list of [`sequence_rules`]: each rule is
//! a delay and a message. Starting a client on the sequence creates a
//! [`follow_ups`] row and schedules the first rule's job on the
//! [`JobQueue`](crate::queue::JobQueue). When a job fires the
//! [`StepExecutor`] sends the message and calls back into the
//! [`SequenceEngine`] to schedule the next rule, until the list runs out.
//!
//! ```text
//! start ──▶ ACTIVE ──pause──▶ PAUSED ──resume──▶ ACTIVE
//!             │                  │
//!             │                  ├─resume, no rule left──▶ COMPLETED
//!             │                  └─convert───────────────▶ CONVERTED
//!             ├─advance, no rule left─▶ COMPLETED
//!             ├─cancel───────────────▶ CANCELLED
//!             └─convert──────────────▶ CONVERTED
//! ```
//!
//! A client has at most one ACTIVE follow-up per workspace.

pub mod engine;
pub mod entities;
pub mod executor;
pub mod rules;
pub mod types;

pub use engine::SequenceEngine;
pub use entities::{follow_ups, sequence_rules};
pub use executor::{MessageSender, OutboundMessage, StepExecutor};
pub use types::{DataIntegrityWarning, FollowUpStatus, Outcome, SequenceError, Transition};
