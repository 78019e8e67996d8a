use std::collections::{BTreeMap, btree_map::Entry};

use thiserror::Error;

use crate::{
    types::{IdentityKey, Message},
    window::WindowPolicy,
};

/// Errors that can occur while editing a message list.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// A removal referenced a key that is not present in the list.
    #[error("message with identity {0:?} was not found")]
    MissingMessage(IdentityKey),
}

/// Ordered, deduplicated, windowed view of the room stream.
///
/// Sorted ascending by `created_at_ms`; ties keep identity-key order.
/// Instances are immutable: every operation returns a new list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageList {
    items: Vec<Message>,
}

impl MessageList {
    /// Messages in display order.
    pub fn items(&self) -> &[Message] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&Message> {
        self.items.iter().find(|item| item.identity_key() == *key)
    }

    /// Timestamp of the newest retained message.
    pub fn latest_created_at(&self) -> Option<u64> {
        self.items.last().map(|item| item.created_at_ms)
    }

    /// Fold `incoming` into this list; see [`merge`].
    pub fn merged(
        &self,
        incoming: impl IntoIterator<Item = Message>,
        policy: &WindowPolicy,
        now_ms: u64,
    ) -> Self {
        merge(self, incoming, policy, now_ms)
    }

    /// Re-apply the window without any new arrivals.
    pub fn trimmed(&self, policy: &WindowPolicy, now_ms: u64) -> Self {
        Self {
            items: policy.trim(self.items.clone(), now_ms),
        }
    }

    /// Copy of this list with exactly the entry for `key` removed.
    pub fn without(&self, key: &IdentityKey) -> Result<Self, MergeError> {
        let idx = self
            .items
            .iter()
            .position(|item| item.identity_key() == *key)
            .ok_or_else(|| MergeError::MissingMessage(key.clone()))?;

        let mut items = self.items.clone();
        items.remove(idx);
        Ok(Self { items })
    }
}

impl<'a> IntoIterator for &'a MessageList {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Combine `existing` with `incoming` into a new list.
///
/// Entries are keyed by identity; `existing` is inserted first, then
/// `incoming`, each insert shallow-merging into any previous record. The
/// result is sorted by `created_at_ms` and trimmed to the window at `now_ms`.
pub fn merge(
    existing: &MessageList,
    incoming: impl IntoIterator<Item = Message>,
    policy: &WindowPolicy,
    now_ms: u64,
) -> MessageList {
    let mut by_key = BTreeMap::new();
    for message in existing.items.iter().cloned().chain(incoming) {
        upsert(&mut by_key, message);
    }

    let mut items: Vec<Message> = by_key.into_values().collect();
    items.sort_by_key(|item| item.created_at_ms);
    MessageList {
        items: policy.trim(items, now_ms),
    }
}

fn upsert(by_key: &mut BTreeMap<IdentityKey, Message>, message: Message) {
    match by_key.entry(message.identity_key()) {
        Entry::Vacant(slot) => {
            slot.insert(message);
        }
        Entry::Occupied(mut slot) => slot.get_mut().merge_from(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageId, NewMessage};

    const T0: u64 = 1_731_000_000_000;
    const SECOND: u64 = 1_000;
    const HOUR: u64 = 60 * 60 * SECOND;

    fn policy() -> WindowPolicy {
        WindowPolicy::from_millis(3 * HOUR)
    }

    fn msg(id: &str, text: &str, created_at_ms: u64) -> Message {
        Message {
            id: Some(MessageId::new(id)),
            room: "lobby".to_owned(),
            author: "alice".to_owned(),
            text: text.to_owned(),
            created_at_ms,
            user_id: None,
        }
    }

    fn ids(list: &MessageList) -> Vec<&str> {
        list.items()
            .iter()
            .map(|m| m.id.as_ref().map_or("", MessageId::as_str))
            .collect()
    }

    #[test]
    fn backfill_into_empty_list() {
        let list = merge(
            &MessageList::default(),
            vec![msg("1", "hi", T0)],
            &policy(),
            T0 + SECOND,
        );
        assert_eq!(ids(&list), vec!["1"]);
    }

    #[test]
    fn push_appends_in_timestamp_order() {
        let list = merge(
            &MessageList::default(),
            vec![msg("1", "hi", T0)],
            &policy(),
            T0 + SECOND,
        );
        let list = list.merged(vec![msg("2", "yo", T0 + 5 * SECOND)], &policy(), T0 + 5 * SECOND);
        assert_eq!(ids(&list), vec!["1", "2"]);
        assert_eq!(list.latest_created_at(), Some(T0 + 5 * SECOND));
    }

    #[test]
    fn sorts_out_of_order_batches() {
        let list = merge(
            &MessageList::default(),
            vec![
                msg("c", "third", T0 + 3 * SECOND),
                msg("a", "first", T0 + SECOND),
                msg("b", "second", T0 + 2 * SECOND),
            ],
            &policy(),
            T0 + 10 * SECOND,
        );
        assert_eq!(ids(&list), vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicate_delivery_keeps_one_copy() {
        let now = T0 + SECOND;
        let once = merge(&MessageList::default(), vec![msg("1", "hi", T0)], &policy(), now);
        let twice = once.merged(vec![msg("1", "hi", T0)], &policy(), now);
        assert_eq!(twice.len(), 1);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_is_idempotent() {
        let now = T0 + 10 * SECOND;
        let base = merge(
            &MessageList::default(),
            vec![msg("1", "a", T0), msg("2", "b", T0 + SECOND)],
            &policy(),
            now,
        );
        let batch = vec![
            msg("2", "b-edited", T0 + SECOND),
            msg("3", "c", T0 + 2 * SECOND),
            msg("3", "c-later", T0 + 2 * SECOND),
        ];
        let once = base.merged(batch.clone(), &policy(), now);
        let twice = once.merged(batch, &policy(), now);
        assert_eq!(once, twice);
        assert_eq!(once.get(&IdentityKey::Id(MessageId::new("3"))).map(|m| m.text.as_str()), Some("c-later"));
    }

    #[test]
    fn disjoint_batches_commute() {
        let now = T0 + 10 * SECOND;
        let base = merge(&MessageList::default(), vec![msg("1", "a", T0)], &policy(), now);
        let b1 = vec![msg("2", "b", T0 + SECOND), msg("3", "c", T0 + SECOND)];
        let b2 = vec![msg("4", "d", T0 + SECOND), msg("5", "e", T0)];

        let left = base.merged(b1.clone(), &policy(), now).merged(b2.clone(), &policy(), now);
        let right = base.merged(b2, &policy(), now).merged(b1, &policy(), now);
        assert_eq!(left, right);
    }

    #[test]
    fn later_update_matches_single_batch_merge() {
        let now = T0 + 10 * SECOND;
        let a = msg("a", "draft", T0);
        let a_prime = msg("a", "final", T0);
        let b = msg("b", "other", T0 + SECOND);

        let stepwise = merge(&MessageList::default(), vec![a.clone(), b.clone()], &policy(), now)
            .merged(vec![a_prime.clone()], &policy(), now);
        let at_once = merge(&MessageList::default(), vec![a, a_prime, b], &policy(), now);
        assert_eq!(stepwise, at_once);
    }

    #[test]
    fn output_is_windowed_sorted_and_unique() {
        let now = T0 + 4 * HOUR;
        let list = merge(
            &MessageList::default(),
            vec![
                msg("old", "gone", T0),
                msg("x", "kept", T0 + 2 * HOUR),
                msg("y", "kept", T0 + HOUR + 30 * 60 * SECOND),
                msg("x", "kept again", T0 + 2 * HOUR),
            ],
            &policy(),
            now,
        );

        let start = policy().window_start(now);
        assert!(list.items().iter().all(|m| m.created_at_ms >= start));
        assert!(list.items().windows(2).all(|w| w[0].created_at_ms <= w[1].created_at_ms));
        let mut keys: Vec<_> = list.items().iter().map(Message::identity_key).collect();
        keys.dedup();
        assert_eq!(keys.len(), list.len());
        assert_eq!(ids(&list), vec!["y", "x"]);
    }

    #[test]
    fn empty_incoming_only_trims() {
        let list = merge(&MessageList::default(), vec![msg("1", "hi", T0)], &policy(), T0);
        let later = T0 + 3 * HOUR + 60 * SECOND;
        assert_eq!(
            list.merged(Vec::new(), &policy(), later),
            list.trimmed(&policy(), later)
        );
        assert!(list.trimmed(&policy(), later).is_empty());
    }

    #[test]
    fn rollback_removes_exactly_the_pending_message() {
        let now = T0 + 10 * SECOND;
        let base = merge(
            &MessageList::default(),
            vec![msg("1", "a", T0), msg("2", "b", T0 + 5 * SECOND)],
            &policy(),
            now,
        );
        let draft = NewMessage {
            room: "lobby".to_owned(),
            author: "alice".to_owned(),
            text: "hello".to_owned(),
            user_id: None,
        };
        let pending = Message::pending(&draft, T0 + 2 * SECOND);
        let with_pending = base.merged(vec![pending.clone()], &policy(), now);
        assert_eq!(with_pending.len(), 3);

        let rolled_back = with_pending
            .without(&pending.identity_key())
            .expect("pending should be present");
        assert_eq!(rolled_back, base);
    }

    #[test]
    fn reconciliation_leaves_only_the_durable_copy() {
        let now = T0 + 10 * SECOND;
        let draft = NewMessage {
            room: "lobby".to_owned(),
            author: "alice".to_owned(),
            text: "hello".to_owned(),
            user_id: None,
        };
        let pending = Message::pending(&draft, T0 + 2 * SECOND);
        let durable = msg("99", "hello", T0 + 3 * SECOND);

        let list = merge(&MessageList::default(), vec![pending.clone()], &policy(), now)
            // push delivery of the durable row can beat the write response
            .merged(vec![durable.clone()], &policy(), now);
        let reconciled = list
            .without(&pending.identity_key())
            .expect("pending should be present")
            .merged(vec![durable.clone()], &policy(), now);

        assert_eq!(reconciled.items(), &[durable]);
        assert!(!reconciled.items().iter().any(Message::is_pending));
    }

    #[test]
    fn fails_when_removing_missing_key() {
        let key = IdentityKey::Id(MessageId::new("404"));
        let err = MessageList::default()
            .without(&key)
            .expect_err("should reject unknown key");
        assert_eq!(err, MergeError::MissingMessage(key));
    }
}
