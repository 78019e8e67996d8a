use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lobby_core::{
    Clock, FetchQuery, InsertSubscription, Message, MessageId, NewMessage, RoomStore,
    SubscriptionEvent, SubscriptionStatus, SyncError,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SUBSCRIPTION_BUFFER: usize = 64;

/// How [`InMemoryRoomStore`] answers new subscriptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Report `Confirmed` immediately.
    #[default]
    Confirm,
    /// Open the feed but never report health.
    Silent,
    /// Fail the subscribe call.
    Reject,
}

struct Subscriber {
    room: String,
    tx: mpsc::Sender<SubscriptionEvent>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct StoreState {
    rows: Vec<Message>,
    next_id: u64,
    subscribers: Vec<Subscriber>,
    fetch_log: Vec<FetchQuery>,
    fail_queries: bool,
    fail_writes: bool,
    subscription_mode: SubscriptionMode,
}

impl StoreState {
    fn broadcast(&mut self, room: &str, event: &SubscriptionEvent) {
        self.subscribers
            .retain(|sub| !sub.cancel.is_cancelled() && !sub.tx.is_closed());
        for sub in self.subscribers.iter().filter(|sub| sub.room == room) {
            if sub.tx.try_send(event.clone()).is_err() {
                warn!(%room, "in-memory subscriber is full, dropping event");
            }
        }
    }
}

/// Process-local room store with an insert feed and failure injection.
#[derive(Clone)]
pub struct InMemoryRoomStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRoomStore {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock: Arc::new(clock),
        }
    }

    pub fn with_subscription_mode(self, mode: SubscriptionMode) -> Self {
        self.lock().subscription_mode = mode;
        self
    }

    /// Store rows as-is, without notifying subscribers.
    pub fn seed(&self, messages: impl IntoIterator<Item = Message>) {
        self.lock().rows.extend(messages);
    }

    /// Store a message from another client and notify subscribers.
    pub fn insert_remote(&self, draft: &NewMessage) -> Message {
        let now_ms = self.clock.now_ms();
        let mut state = self.lock();
        store_row(&mut state, draft, now_ms)
    }

    /// Push `message` to subscribers without storing it.
    pub fn deliver(&self, room: &str, message: Message) {
        self.lock()
            .broadcast(room, &SubscriptionEvent::Inserted(message));
    }

    /// Report a lifecycle status to every subscriber of `room`.
    pub fn emit_status(&self, room: &str, status: SubscriptionStatus) {
        self.lock()
            .broadcast(room, &SubscriptionEvent::Status(status));
    }

    pub fn set_fail_queries(&self, fail: bool) {
        self.lock().fail_queries = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Every fetch received so far, oldest first.
    pub fn fetch_log(&self) -> Vec<FetchQuery> {
        self.lock().fetch_log.clone()
    }

    pub fn rows(&self) -> Vec<Message> {
        self.lock().rows.clone()
    }

    /// Subscriptions for `room` that have not been cancelled.
    pub fn active_subscriptions(&self, room: &str) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|sub| sub.room == room && !sub.cancel.is_cancelled())
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn store_row(state: &mut StoreState, draft: &NewMessage, now_ms: u64) -> Message {
    state.next_id += 1;
    let message = Message {
        id: Some(MessageId::new(state.next_id.to_string())),
        room: draft.room.clone(),
        author: draft.author.clone(),
        text: draft.text.clone(),
        created_at_ms: now_ms,
        user_id: draft.user_id,
    };
    state.rows.push(message.clone());
    state.broadcast(&draft.room, &SubscriptionEvent::Inserted(message.clone()));
    message
}

#[async_trait]
impl RoomStore for InMemoryRoomStore {
    async fn fetch_messages(&self, query: &FetchQuery) -> Result<Vec<Message>, SyncError> {
        let mut state = self.lock();
        state.fetch_log.push(query.clone());
        if state.fail_queries {
            return Err(SyncError::query("query_failed", "in-memory query failure"));
        }

        let since = query.since_ms.unwrap_or(0);
        let mut rows: Vec<Message> = state
            .rows
            .iter()
            .filter(|row| row.room == query.room && row.created_at_ms >= since)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at_ms);
        rows.truncate(usize::from(query.limit));
        Ok(rows)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message, SyncError> {
        let now_ms = self.clock.now_ms();
        let mut state = self.lock();
        if state.fail_writes {
            return Err(SyncError::write("insert_failed", "in-memory write failure"));
        }
        Ok(store_row(&mut state, message, now_ms))
    }

    async fn subscribe_insertions(&self, room: &str) -> Result<InsertSubscription, SyncError> {
        let mut state = self.lock();
        if state.subscription_mode == SubscriptionMode::Reject {
            return Err(SyncError::subscription(
                "subscribe_rejected",
                "in-memory subscription rejected",
            ));
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        if state.subscription_mode == SubscriptionMode::Confirm {
            let _ = tx.try_send(SubscriptionEvent::Status(SubscriptionStatus::Confirmed));
        }
        state.subscribers.push(Subscriber {
            room: room.to_owned(),
            tx,
            cancel: cancel.clone(),
        });
        debug!(%room, "in-memory subscription opened");
        Ok(InsertSubscription::new(rx, cancel))
    }
}

/// Store view bound to one room.
#[derive(Clone)]
pub struct ScopedRoomStore<S: RoomStore> {
    inner: S,
    room: String,
}

impl<S: RoomStore> ScopedRoomStore<S> {
    pub fn new(inner: S, room: impl Into<String>) -> Self {
        Self {
            inner,
            room: room.into(),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Ascending page starting at `since_ms`; rows from other rooms are dropped.
    pub async fn fetch_since(
        &self,
        since_ms: Option<u64>,
        limit: u16,
    ) -> Result<Vec<Message>, SyncError> {
        let query = FetchQuery {
            room: self.room.clone(),
            since_ms,
            limit,
        };
        let mut rows = self.inner.fetch_messages(&query).await?;
        rows.retain(|row| {
            let ours = row.room == self.room;
            if !ours {
                warn!(room = %self.room, other = %row.room, "dropping row from another room");
            }
            ours
        });
        Ok(rows)
    }

    pub async fn insert(
        &self,
        author: &str,
        text: &str,
        user_id: Option<i64>,
    ) -> Result<Message, SyncError> {
        self.inner
            .insert_message(&NewMessage {
                room: self.room.clone(),
                author: author.to_owned(),
                text: text.to_owned(),
                user_id,
            })
            .await
    }

    pub async fn subscribe(&self) -> Result<InsertSubscription, SyncError> {
        self.inner.subscribe_insertions(&self.room).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lobby_core::{ManualClock, SyncErrorCategory};

    const T0: u64 = 1_731_000_000_000;

    fn draft(room: &str, text: &str) -> NewMessage {
        NewMessage {
            room: room.to_owned(),
            author: "alice".to_owned(),
            text: text.to_owned(),
            user_id: None,
        }
    }

    #[tokio::test]
    async fn fetch_filters_by_room_and_since_in_ascending_order() {
        let clock = ManualClock::new(T0);
        let store = InMemoryRoomStore::new(clock.clone());
        store.insert_remote(&draft("lobby", "one"));
        clock.set(T0 - 5_000);
        store.insert_remote(&draft("lobby", "earlier"));
        clock.set(T0 + 5_000);
        store.insert_remote(&draft("lobby", "two"));
        store.insert_remote(&draft("garden", "elsewhere"));

        let rows = store
            .fetch_messages(&FetchQuery {
                room: "lobby".into(),
                since_ms: Some(T0),
                limit: 10,
            })
            .await
            .expect("fetch should work");

        let texts: Vec<&str> = rows.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(store.fetch_log().len(), 1);
    }

    #[tokio::test]
    async fn fetch_honors_limit() {
        let store = InMemoryRoomStore::new(ManualClock::new(T0));
        for i in 0..5 {
            store.insert_remote(&draft("lobby", &format!("m{i}")));
        }
        let rows = store
            .fetch_messages(&FetchQuery {
                room: "lobby".into(),
                since_ms: None,
                limit: 3,
            })
            .await
            .expect("fetch should work");
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_notifies_subscribers() {
        let store = InMemoryRoomStore::new(ManualClock::new(T0));
        let mut sub = store
            .subscribe_insertions("lobby")
            .await
            .expect("subscribe should work");
        assert_eq!(
            sub.next_event().await,
            Some(SubscriptionEvent::Status(SubscriptionStatus::Confirmed))
        );

        let stored = store
            .insert_message(&draft("lobby", "hello"))
            .await
            .expect("insert should work");
        assert_eq!(stored.id, Some(MessageId::new("1")));
        assert_eq!(stored.created_at_ms, T0);
        assert_eq!(
            sub.next_event().await,
            Some(SubscriptionEvent::Inserted(stored))
        );
    }

    #[tokio::test]
    async fn unsubscribe_releases_subscriber() {
        let store = InMemoryRoomStore::new(ManualClock::new(T0))
            .with_subscription_mode(SubscriptionMode::Silent);
        let sub = store
            .subscribe_insertions("lobby")
            .await
            .expect("subscribe should work");
        assert_eq!(store.active_subscriptions("lobby"), 1);
        sub.unsubscribe();
        assert_eq!(store.active_subscriptions("lobby"), 0);
    }

    #[tokio::test]
    async fn injected_failures_use_stable_categories() {
        let store = InMemoryRoomStore::new(ManualClock::new(T0))
            .with_subscription_mode(SubscriptionMode::Reject);
        store.set_fail_queries(true);
        store.set_fail_writes(true);

        let query_err = store
            .fetch_messages(&FetchQuery {
                room: "lobby".into(),
                since_ms: None,
                limit: 1,
            })
            .await
            .expect_err("query must fail");
        assert_eq!(query_err.category, SyncErrorCategory::Query);

        let write_err = store
            .insert_message(&draft("lobby", "x"))
            .await
            .expect_err("write must fail");
        assert_eq!(write_err.category, SyncErrorCategory::Write);
        assert!(store.rows().is_empty());

        let sub_err = store
            .subscribe_insertions("lobby")
            .await
            .expect_err("subscribe must fail");
        assert_eq!(sub_err.category, SyncErrorCategory::Subscription);
    }

    #[tokio::test]
    async fn scoped_store_isolates_rooms() {
        let base = InMemoryRoomStore::new(ManualClock::new(T0));
        let lobby = ScopedRoomStore::new(base.clone(), "lobby");
        let garden = ScopedRoomStore::new(base.clone(), "garden");

        lobby.insert("alice", "one", None).await.expect("insert lobby");
        garden.insert("bob", "two", Some(2)).await.expect("insert garden");

        let rows = lobby.fetch_since(None, 10).await.expect("fetch lobby");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "one");
        let rows = garden.fetch_since(None, 10).await.expect("fetch garden");
        assert_eq!(rows[0].user_id, Some(2));
    }

    struct LeakyStore;

    #[async_trait]
    impl RoomStore for LeakyStore {
        async fn fetch_messages(&self, query: &FetchQuery) -> Result<Vec<Message>, SyncError> {
            Ok(vec![
                Message {
                    id: Some(MessageId::new("1")),
                    room: query.room.clone(),
                    author: "alice".into(),
                    text: "mine".into(),
                    created_at_ms: T0,
                    user_id: None,
                },
                Message {
                    id: Some(MessageId::new("2")),
                    room: "elsewhere".into(),
                    author: "bob".into(),
                    text: "not mine".into(),
                    created_at_ms: T0,
                    user_id: None,
                },
            ])
        }

        async fn insert_message(&self, _message: &NewMessage) -> Result<Message, SyncError> {
            Err(SyncError::write("unavailable", "mock outage"))
        }

        async fn subscribe_insertions(
            &self,
            _room: &str,
        ) -> Result<InsertSubscription, SyncError> {
            Err(SyncError::subscription("unavailable", "mock outage"))
        }
    }

    #[tokio::test]
    async fn scoped_store_drops_foreign_rows_and_propagates_failures() {
        let scoped = ScopedRoomStore::new(LeakyStore, "lobby");
        let rows = scoped.fetch_since(None, 10).await.expect("fetch should work");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "mine");

        let err = scoped
            .insert("alice", "hi", None)
            .await
            .expect_err("insert must fail");
        assert_eq!(err, SyncError::write("unavailable", "mock outage"));
    }
}
