//! Sequence rule storage and ordering
//!
//! Rules have no explicit position: a workspace's sequence is its rules in
//! creation order, ties broken by id.

use crate::error::FrameworkError;
use crate::sequence::entities::sequence_rules;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use std::time::Duration;

/// Longest delay a step may be scheduled with
pub const MAX_DELAY_MS: i64 = 366 * 24 * 60 * 60 * 1000;

/// Append a rule to a workspace's sequence
pub async fn create<C: ConnectionTrait>(
    conn: &C,
    workspace_id: i64,
    delay_ms: i64,
    message_content: impl Into<String>,
) -> Result<sequence_rules::Model, FrameworkError> {
    let now = Utc::now().naive_utc();
    let model = sequence_rules::ActiveModel {
        workspace_id: Set(workspace_id),
        delay_ms: Set(delay_ms),
        message_content: Set(message_content.into()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    Ok(model.insert(conn).await?)
}

/// A workspace's rules in sequence order
pub async fn ordered_for_workspace<C: ConnectionTrait>(
    conn: &C,
    workspace_id: i64,
) -> Result<Vec<sequence_rules::Model>, FrameworkError> {
    Ok(sequence_rules::Entity::find()
        .filter(sequence_rules::Column::WorkspaceId.eq(workspace_id))
        .order_by_asc(sequence_rules::Column::CreatedAt)
        .order_by_asc(sequence_rules::Column::Id)
        .all(conn)
        .await?)
}

pub async fn find<C: ConnectionTrait>(
    conn: &C,
    rule_id: i64,
) -> Result<Option<sequence_rules::Model>, FrameworkError> {
    Ok(sequence_rules::Entity::find_by_id(rule_id).one(conn).await?)
}

/// The rule's delay, or why it can't be used
pub fn delay_of(rule: &sequence_rules::Model) -> Result<Duration, &'static str> {
    match rule.delay_ms {
        ms if ms < 0 => Err("negative delay"),
        ms if ms > MAX_DELAY_MS => Err("delay longer than a year"),
        ms => Ok(Duration::from_millis(ms as u64)),
    }
}

/// The rule that follows the last scheduled one
///
/// Looks the last rule up by identity. If it is gone from the list (deleted
/// since), falls back to position: `current_step_order` is the 1-based order
/// of the last scheduled step, so the next rule sits at that index. Returns
/// the rule with its 0-based position.
pub fn next_after(
    rules: &[sequence_rules::Model],
    last_rule_id: Option<i64>,
    current_step_order: i32,
) -> Option<(usize, &sequence_rules::Model)> {
    let index = last_rule_id
        .and_then(|id| rules.iter().position(|rule| rule.id == id))
        .map(|position| position + 1)
        .unwrap_or_else(|| current_step_order.max(0) as usize);

    rules.get(index).map(|rule| (index, rule))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestDatabase;
    use pretty_assertions::assert_eq;

    fn rule(id: i64, delay_ms: i64) -> sequence_rules::Model {
        let now = Utc::now().naive_utc();
        sequence_rules::Model {
            id,
            workspace_id: 1,
            delay_ms,
            message_content: format!("step {}", id),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn next_follows_rule_identity() {
        let rules = vec![rule(10, 0), rule(20, 0), rule(30, 0)];

        assert_eq!(next_after(&rules, Some(10), 1).map(|(i, r)| (i, r.id)), Some((1, 20)));
        assert_eq!(next_after(&rules, Some(30), 3), None);
        // Identity wins over a stale position.
        assert_eq!(next_after(&rules, Some(20), 1).map(|(i, _)| i), Some(2));
    }

    #[test]
    fn next_falls_back_to_position_for_deleted_rules() {
        let rules = vec![rule(10, 0), rule(30, 0)];
        assert_eq!(next_after(&rules, Some(20), 1).map(|(_, r)| r.id), Some(30));
        assert_eq!(next_after(&rules, None, 2), None);
    }

    #[test]
    fn unusable_delays_are_reported() {
        assert_eq!(delay_of(&rule(1, 1500)), Ok(Duration::from_millis(1500)));
        assert!(delay_of(&rule(1, -1)).is_err());
        assert!(delay_of(&rule(1, MAX_DELAY_MS + 1)).is_err());
    }

    #[tokio::test]
    async fn rules_come_back_in_creation_order() {
        let db = TestDatabase::fresh().await.expect("test db");
        let first = create(db.conn(), 7, 0, "hello").await.unwrap();
        let second = create(db.conn(), 7, 1000, "again").await.unwrap();
        create(db.conn(), 8, 0, "other workspace").await.unwrap();

        let ids: Vec<i64> = ordered_for_workspace(db.conn(), 7)
            .await
            .unwrap()
            .into_iter()
            .map(|rule| rule.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
