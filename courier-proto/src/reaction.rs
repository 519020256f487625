//! Emoji reactions and their per-message aggregate.
//!
//! The aggregate is never updated incrementally. Every reaction change
//! refetches the raw rows and rebuilds it with [`aggregate_reactions`], so
//! duplicated or reordered change events cannot make the counts drift.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::message::{MessageId, Timestamp, UserId};

/// One user's reaction to one message, as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRow {
    /// Message reacted to.
    pub message_id: MessageId,
    /// Reacting user.
    pub user_id: UserId,
    /// The emoji.
    pub emoji: String,
    /// When the reaction was added.
    pub created_at: Timestamp,
}

/// Reactions to a message grouped by emoji.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionAggregate {
    /// The emoji.
    pub emoji: String,
    /// Number of distinct users who reacted with it.
    pub count: usize,
    /// Users who reacted, in order of their first reaction.
    pub reacted_by_user_ids: Vec<UserId>,
    /// Whether the viewing user is among them.
    pub has_reacted: bool,
}

/// Groups `rows` by emoji.
///
/// Groups appear in the order their emoji first occurs in `rows`, and users
/// within a group in the order they first reacted. A repeated
/// `(user, emoji)` row counts once. The result depends only on `rows` and
/// `viewer`.
#[must_use]
pub fn aggregate_reactions(rows: &[ReactionRow], viewer: &UserId) -> Vec<ReactionAggregate> {
    let mut groups: Vec<ReactionAggregate> = Vec::new();
    let mut seen: HashSet<(&str, &UserId)> = HashSet::new();

    for row in rows {
        if !seen.insert((row.emoji.as_str(), &row.user_id)) {
            continue;
        }
        let idx = if let Some(idx) = groups.iter().position(|g| g.emoji == row.emoji) {
            idx
        } else {
            groups.push(ReactionAggregate {
                emoji: row.emoji.clone(),
                count: 0,
                reacted_by_user_ids: Vec::new(),
                has_reacted: false,
            });
            groups.len() - 1
        };
        let group = &mut groups[idx];
        group.count += 1;
        group.reacted_by_user_ids.push(row.user_id.clone());
        if row.user_id == *viewer {
            group.has_reacted = true;
        }
    }

    groups
}
