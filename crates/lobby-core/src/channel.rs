use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

use crate::{
    merge::MessageList,
    types::{SessionCommand, SessionEvent, SyncSource},
};

/// Broadcast event stream type used by frontend subscribers.
pub type EventStream = broadcast::Receiver<SessionEvent>;

/// Errors returned by session channel operations.
#[derive(Debug, Error)]
pub enum SessionChannelError {
    /// The session stopped and no longer accepts commands.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Channels shared by a session runtime and its handles: commands in,
/// events out, and the latest message list as a watch value.
#[derive(Clone, Debug)]
pub struct SessionChannels {
    command_tx: mpsc::Sender<SessionCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
    list_tx: Arc<watch::Sender<MessageList>>,
}

impl SessionChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<SessionCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        let (list_tx, _) = watch::channel(MessageList::default());

        (
            Self {
                command_tx,
                event_tx,
                list_tx: Arc::new(list_tx),
            },
            command_rx,
        )
    }

    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Reactive view of the message list; starts empty.
    pub fn messages(&self) -> watch::Receiver<MessageList> {
        self.list_tx.subscribe()
    }

    /// Copy of the last published list.
    pub fn snapshot(&self) -> MessageList {
        self.list_tx.borrow().clone()
    }

    /// Send one command to the runtime.
    pub async fn send_command(&self, command: SessionCommand) -> Result<(), SessionChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SessionChannelError::CommandChannelClosed)
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Replace the watched list and announce the change.
    pub fn publish(&self, list: MessageList, source: SyncSource) {
        let count = list.len();
        self.list_tx.send_replace(list);
        self.emit(SessionEvent::MessagesChanged { source, count });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        types::{Message, MessageId, SourceState},
        window::WindowPolicy,
    };

    #[tokio::test]
    async fn sends_commands_to_receiver() {
        let (channels, mut rx) = SessionChannels::new(8, 8);
        channels
            .send_command(SessionCommand::Send {
                text: "hello".into(),
            })
            .await
            .expect("command send should work");

        let cmd = rx.recv().await.expect("receiver should have a command");
        match cmd {
            SessionCommand::Send { text } => assert_eq!(text, "hello"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reports_closed_command_channel() {
        let (channels, rx) = SessionChannels::new(1, 1);
        drop(rx);
        let err = channels
            .send_command(SessionCommand::Stop)
            .await
            .expect_err("closed receiver must fail");
        assert!(matches!(err, SessionChannelError::CommandChannelClosed));
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let (channels, _) = SessionChannels::new(4, 16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();

        channels.emit(SessionEvent::SourceStateChanged {
            state: SourceState::Live,
        });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[tokio::test]
    async fn publish_updates_watchers_and_emits_count() {
        let (channels, _) = SessionChannels::new(4, 16);
        let mut events = channels.subscribe();
        let mut messages = channels.messages();
        assert!(messages.borrow().is_empty());

        let list = MessageList::default().merged(
            [Message {
                id: Some(MessageId::new("1")),
                room: "lobby".into(),
                author: "alice".into(),
                text: "hi".into(),
                created_at_ms: 1_000,
                user_id: None,
            }],
            &WindowPolicy::from_millis(10_000),
            2_000,
        );
        channels.publish(list.clone(), SyncSource::Push);

        messages.changed().await.expect("list should change");
        assert_eq!(*messages.borrow(), list);
        assert_eq!(channels.snapshot(), list);
        assert_eq!(
            events.recv().await.expect("event"),
            SessionEvent::MessagesChanged {
                source: SyncSource::Push,
                count: 1,
            }
        );
    }
}
