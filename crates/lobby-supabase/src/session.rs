//! Per-room session runtime: push/poll arbitration, optimistic sends and the
//! window janitor, all owned by one task.
//!
//! Every mutation of the message list happens on the runtime task. Network
//! work runs in a [`JoinSet`] and is applied only after the loop confirms the
//! session is still running.

use std::{collections::HashMap, sync::Arc};

use lobby_core::{
    Clock, CursorTracker, EventStream, IdentityKey, InsertSubscription, Message, MessageId,
    MessageList, NewMessage, RoomStore, SendOutcome, SessionChannelError, SessionChannels,
    SessionCommand, SessionEvent, SourceStateMachine, SubscriptionEvent, SubscriptionStatus,
    SyncConfig, SyncError, SyncSource, SystemClock, WindowPolicy, normalize_send_outcome,
    send_failure_notice,
};
use lobby_platform::ScopedRoomStore;
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::{self, JoinError, JoinHandle, JoinSet},
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Who the session speaks for, and how it syncs.
#[derive(Clone)]
pub struct SessionOptions {
    pub room: String,
    pub author: String,
    pub user_id: Option<i64>,
    pub config: SyncConfig,
    pub clock: Arc<dyn Clock>,
}

impl SessionOptions {
    pub fn new(room: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            author: author.into(),
            user_id: None,
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

/// Frontend handle to a running session.
///
/// Dropping the handle cancels the session; [`SessionHandle::stop`] also
/// waits for teardown to finish.
pub struct SessionHandle {
    channels: SessionChannels,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Queue `text` for an optimistic send. Blank text is ignored by the runtime.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionChannelError> {
        self.channels
            .send_command(SessionCommand::Send { text: text.into() })
            .await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Reactive view of the message list.
    pub fn messages(&self) -> watch::Receiver<MessageList> {
        self.channels.messages()
    }

    pub fn snapshot(&self) -> MessageList {
        self.channels.snapshot()
    }

    /// Cancel the session and wait for teardown. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.stop.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!(error = %err, "session task ended abnormally");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Validate `options` and start a session task for one room.
pub fn spawn_session<S: RoomStore>(
    store: S,
    options: SessionOptions,
) -> Result<SessionHandle, SyncError> {
    options.config.validate()?;
    if options.room.trim().is_empty() {
        return Err(SyncError::config("invalid_room", "room must not be empty"));
    }

    let (channels, command_rx) = SessionChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
    let stop = CancellationToken::new();

    let runtime = SessionRuntime {
        store: Arc::new(ScopedRoomStore::new(store, options.room)),
        author: options.author,
        user_id: options.user_id,
        policy: WindowPolicy::from_millis(options.config.horizon_ms),
        config: options.config,
        clock: options.clock,
        channels: channels.clone(),
        command_rx,
        list: MessageList::default(),
        cursor: CursorTracker::default(),
        sources: SourceStateMachine::default(),
        in_flight: JoinSet::new(),
        poll_task: None,
        pending_sends: HashMap::new(),
        stop: stop.clone(),
    };
    let task = tokio::spawn(runtime.run());

    Ok(SessionHandle {
        channels,
        stop,
        task: Mutex::new(Some(task)),
    })
}

enum Completion {
    Backfill(Result<Vec<Message>, SyncError>),
    Poll(Result<Vec<Message>, SyncError>),
    Send(Result<Message, SyncError>),
}

/// Optimistic entry waiting on its write task.
struct PendingSend {
    id: MessageId,
    key: IdentityKey,
}

struct SessionRuntime<S: RoomStore> {
    store: Arc<ScopedRoomStore<S>>,
    author: String,
    user_id: Option<i64>,
    config: SyncConfig,
    policy: WindowPolicy,
    clock: Arc<dyn Clock>,
    channels: SessionChannels,
    command_rx: mpsc::Receiver<SessionCommand>,
    list: MessageList,
    cursor: CursorTracker,
    sources: SourceStateMachine,
    in_flight: JoinSet<Completion>,
    /// Set while a poll fetch runs; cleared however the task ends.
    poll_task: Option<task::Id>,
    pending_sends: HashMap<task::Id, PendingSend>,
    stop: CancellationToken,
}

impl<S: RoomStore> SessionRuntime<S> {
    async fn run(mut self) {
        info!(room = %self.store.room(), author = %self.author, "session starting");
        self.spawn_backfill();

        let mut subscription = self.open_subscription().await;
        if !self.stop.is_cancelled() {
            self.drive(&mut subscription).await;
        }
        self.shutdown(subscription).await;
    }

    async fn open_subscription(&mut self) -> Option<InsertSubscription> {
        let result = tokio::select! {
            biased;

            _ = self.stop.cancelled() => return None,
            result = self.store.subscribe() => result,
        };

        match result {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(room = %self.store.room(), code = %err.code, "subscription failed, falling back to polling");
                self.apply_status(SubscriptionStatus::Errored);
                None
            }
        }
    }

    /// Event loop. Timers live here so they are released before teardown.
    async fn drive(&mut self, subscription: &mut Option<InsertSubscription>) {
        let grace = tokio::time::sleep(self.config.fallback_grace());
        tokio::pin!(grace);
        let mut grace_pending = true;

        let janitor_period = self.config.janitor_interval();
        let mut janitor = tokio::time::interval_at(Instant::now() + janitor_period, janitor_period);
        janitor.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut poll_timer: Option<Interval> = None;
        self.sync_poll_timer(&mut poll_timer);

        loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled() => break,
                command = self.command_rx.recv() => match command {
                    Some(SessionCommand::Send { text }) => self.handle_send(text),
                    Some(SessionCommand::Stop) | None => break,
                },
                event = next_subscription_event(subscription), if subscription.is_some() => {
                    match event {
                        Some(SubscriptionEvent::Inserted(message)) => self.apply_push(message),
                        Some(SubscriptionEvent::Status(status)) => self.apply_status(status),
                        None => {
                            warn!(room = %self.store.room(), "insert feed ended");
                            *subscription = None;
                            self.apply_status(SubscriptionStatus::Errored);
                        }
                    }
                    self.sync_poll_timer(&mut poll_timer);
                }
                () = &mut grace, if grace_pending => {
                    grace_pending = false;
                    self.apply_grace_expired();
                    self.sync_poll_timer(&mut poll_timer);
                }
                _ = janitor.tick() => self.run_janitor(),
                () = next_poll_tick(&mut poll_timer), if poll_timer.is_some() => self.spawn_poll(),
                Some(joined) = self.in_flight.join_next_with_id(), if !self.in_flight.is_empty() => {
                    if self.stop.is_cancelled() {
                        break;
                    }
                    self.apply_completion(joined);
                }
            }
        }
    }

    async fn shutdown(mut self, subscription: Option<InsertSubscription>) {
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }

        self.in_flight.abort_all();
        while self.in_flight.join_next().await.is_some() {}

        for event in self.sources.on_stop() {
            self.channels.emit(event);
        }
        self.channels.emit(SessionEvent::Stopped);
        info!(room = %self.store.room(), "session stopped");
    }

    fn spawn_backfill(&mut self) {
        let since = self.policy.window_start(self.clock.now_ms());
        let limit = self.config.page_limit;
        let store = Arc::clone(&self.store);
        debug!(room = %store.room(), since, limit, "starting backfill");
        self.in_flight.spawn(async move {
            Completion::Backfill(store.fetch_since(Some(since), limit).await)
        });
    }

    fn spawn_poll(&mut self) {
        if self.poll_task.is_some() {
            debug!(room = %self.store.room(), "previous poll still running, skipping tick");
            return;
        }

        let since = self
            .cursor
            .since(self.policy.window_start(self.clock.now_ms()));
        let limit = self.config.page_limit;
        let store = Arc::clone(&self.store);
        let handle = self.in_flight.spawn(async move {
            Completion::Poll(store.fetch_since(Some(since), limit).await)
        });
        self.poll_task = Some(handle.id());
    }

    fn handle_send(&mut self, text: String) {
        if self.stop.is_cancelled() {
            debug!(room = %self.store.room(), "session stopping, dropping send");
            return;
        }
        let text = text.trim();
        if text.is_empty() {
            debug!(room = %self.store.room(), "ignoring blank send");
            return;
        }

        let draft = NewMessage {
            room: self.store.room().to_owned(),
            author: self.author.clone(),
            text: text.to_owned(),
            user_id: self.user_id,
        };
        let pending = Message::pending(&draft, self.clock.now_ms());
        let pending_key = pending.identity_key();
        let Some(pending_id) = pending.id.clone() else {
            return;
        };
        debug!(room = %draft.room, pending_id = %pending_id, "optimistic send");
        self.merge_in([pending], SyncSource::Send);

        let store = Arc::clone(&self.store);
        let handle = self.in_flight.spawn(async move {
            Completion::Send(
                store
                    .insert(&draft.author, &draft.text, draft.user_id)
                    .await,
            )
        });
        self.pending_sends.insert(
            handle.id(),
            PendingSend {
                id: pending_id,
                key: pending_key,
            },
        );
    }

    fn apply_completion(&mut self, joined: Result<(task::Id, Completion), JoinError>) {
        let (id, completion) = match joined {
            Ok(done) => done,
            Err(err) => {
                warn!(room = %self.store.room(), error = %err, "session task failed");
                self.release_failed_task(&err);
                return;
            }
        };

        match completion {
            Completion::Backfill(Ok(rows)) => {
                info!(room = %self.store.room(), count = rows.len(), "backfill loaded");
                self.cursor
                    .advance_to_latest(rows.iter().map(|row| row.created_at_ms));
                self.merge_in(rows, SyncSource::Backfill);
            }
            Completion::Backfill(Err(err)) => {
                warn!(room = %self.store.room(), code = %err.code, message = %err.message, "backfill failed");
            }
            Completion::Poll(result) => {
                self.poll_task = None;
                match result {
                    Ok(rows) => {
                        self.cursor
                            .advance_to_latest(rows.iter().map(|row| row.created_at_ms));
                        self.merge_in(rows, SyncSource::Poll);
                    }
                    Err(err) => {
                        debug!(room = %self.store.room(), code = %err.code, "poll failed, retrying next tick");
                    }
                }
            }
            Completion::Send(result) => match self.pending_sends.remove(&id) {
                Some(pending) => self.finish_send(pending, result),
                None => debug!(room = %self.store.room(), "write finished for unknown send"),
            },
        }
    }

    /// A panicked or aborted task never reports its completion, so undo the
    /// bookkeeping it would have cleared.
    fn release_failed_task(&mut self, err: &JoinError) {
        let id = err.id();
        if self.poll_task == Some(id) {
            self.poll_task = None;
        } else if let Some(pending) = self.pending_sends.remove(&id) {
            let error = SyncError::internal("send_task_failed", err.to_string());
            self.finish_send(pending, Err(error));
        }
    }

    fn finish_send(&mut self, pending: PendingSend, result: Result<Message, SyncError>) {
        let PendingSend {
            id: pending_id,
            key: pending_key,
        } = pending;
        let without_pending = match self.list.without(&pending_key) {
            Ok(list) => list,
            Err(err) => {
                debug!(room = %self.store.room(), error = %err, "pending message already gone");
                self.list.clone()
            }
        };

        let outcome = match result {
            Ok(durable) => {
                debug!(room = %self.store.room(), pending_id = %pending_id, "send confirmed");
                self.cursor.advance(durable.created_at_ms);
                let message_id = durable.id.clone();
                let next = without_pending.merged([durable], &self.policy, self.clock.now_ms());
                self.replace_list(next, SyncSource::Send);
                SendOutcome::Success { message_id }
            }
            Err(error) => {
                warn!(
                    room = %self.store.room(),
                    pending_id = %pending_id,
                    notice = %send_failure_notice(&error),
                    "send failed, rolling back"
                );
                self.replace_list(without_pending, SyncSource::Send);
                SendOutcome::Failure { error }
            }
        };

        self.channels
            .emit(normalize_send_outcome(pending_id, outcome));
    }

    fn apply_push(&mut self, message: Message) {
        if self.stop.is_cancelled() {
            return;
        }
        if message.room != self.store.room() {
            warn!(room = %self.store.room(), other = %message.room, "ignoring push for another room");
            return;
        }
        self.cursor.advance(message.created_at_ms);
        self.merge_in([message], SyncSource::Push);
    }

    fn apply_status(&mut self, status: SubscriptionStatus) {
        match self.sources.on_subscription_status(status) {
            Ok(events) => self.emit_transitions(events),
            Err(err) => debug!(code = %err.code, "ignoring subscription status"),
        }
    }

    fn apply_grace_expired(&mut self) {
        match self.sources.on_grace_expired() {
            Ok(events) => self.emit_transitions(events),
            Err(err) => debug!(code = %err.code, "ignoring grace expiry"),
        }
    }

    fn emit_transitions(&self, events: Vec<SessionEvent>) {
        for event in events {
            if let SessionEvent::SourceStateChanged { state } = &event {
                info!(room = %self.store.room(), state = ?state, "source state changed");
            }
            self.channels.emit(event);
        }
    }

    /// Start or stop the poll timer to match the source state.
    fn sync_poll_timer(&self, timer: &mut Option<Interval>) {
        match (self.sources.should_poll(), timer.is_some()) {
            (true, false) => {
                let mut interval = tokio::time::interval(self.config.poll_interval());
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                *timer = Some(interval);
                info!(room = %self.store.room(), every_ms = self.config.poll_interval_ms, "poll fallback started");
            }
            (false, true) => {
                *timer = None;
                info!(room = %self.store.room(), "poll fallback stopped");
            }
            _ => {}
        }
    }

    fn run_janitor(&mut self) {
        let now_ms = self.clock.now_ms();
        let next = self.list.trimmed(&self.policy, now_ms);
        self.replace_list(next, SyncSource::Janitor);

        if self.list.is_empty() {
            let window_start = self.policy.window_start(now_ms);
            self.cursor.reset(window_start);
            debug!(room = %self.store.room(), cursor = window_start, "list empty, cursor reset to window start");
        }
    }

    fn merge_in(&mut self, incoming: impl IntoIterator<Item = Message>, source: SyncSource) {
        let next = self
            .list
            .merged(incoming, &self.policy, self.clock.now_ms());
        self.replace_list(next, source);
    }

    fn replace_list(&mut self, next: MessageList, source: SyncSource) {
        if next == self.list {
            return;
        }
        self.list = next;
        debug!(room = %self.store.room(), source = ?source, count = self.list.len(), "message list updated");
        self.channels.publish(self.list.clone(), source);
    }
}

async fn next_subscription_event(
    subscription: &mut Option<InsertSubscription>,
) -> Option<SubscriptionEvent> {
    match subscription {
        Some(subscription) => subscription.next_event().await,
        None => std::future::pending().await,
    }
}

async fn next_poll_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
