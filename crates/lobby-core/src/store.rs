//! Backend collaborator contract: durable store plus insert feed.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::SyncError,
    types::{Message, NewMessage, SubscriptionStatus},
};

/// Parameters for one ascending fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchQuery {
    /// Room to read.
    pub room: String,
    /// Inclusive lower bound on `created_at_ms`.
    pub since_ms: Option<u64>,
    /// Maximum number of rows.
    pub limit: u16,
}

/// One item delivered by an insert subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Inserted(Message),
    Status(SubscriptionStatus),
}

/// Live insert feed for one room.
///
/// Dropping the handle cancels the feed.
#[derive(Debug)]
pub struct InsertSubscription {
    events: mpsc::Receiver<SubscriptionEvent>,
    cancel: CancellationToken,
}

impl InsertSubscription {
    /// Pair a receiver with the token the producer watches for teardown.
    pub fn new(events: mpsc::Receiver<SubscriptionEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// Next event, or `None` once the producer is gone.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(self) {
        self.cancel.cancel();
    }
}

impl Drop for InsertSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Durable message store with an insert feed, scoped by room.
#[async_trait]
pub trait RoomStore: Send + Sync + 'static {
    /// Rows matching `query`, ascending by `created_at_ms`.
    async fn fetch_messages(&self, query: &FetchQuery) -> Result<Vec<Message>, SyncError>;

    /// Store `message` and return the backend record.
    async fn insert_message(&self, message: &NewMessage) -> Result<Message, SyncError>;

    /// Open an insert feed for `room`.
    async fn subscribe_insertions(&self, room: &str) -> Result<InsertSubscription, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_subscription_cancels_producer_token() {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let watcher = cancel.clone();
        let mut subscription = InsertSubscription::new(rx, cancel);

        tx.send(SubscriptionEvent::Status(SubscriptionStatus::Confirmed))
            .await
            .expect("send should work");
        assert_eq!(
            subscription.next_event().await,
            Some(SubscriptionEvent::Status(SubscriptionStatus::Confirmed))
        );

        drop(subscription);
        assert!(watcher.is_cancelled());
    }

    #[tokio::test]
    async fn reports_end_of_feed() {
        let (tx, rx) = mpsc::channel(1);
        let mut subscription = InsertSubscription::new(rx, CancellationToken::new());
        drop(tx);
        assert_eq!(subscription.next_event().await, None);
    }
}
