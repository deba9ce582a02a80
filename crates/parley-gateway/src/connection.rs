use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_core::{ChatError, CurrentUser, Identity, Messenger, Store, Subscription, SubscriptionHandle};
use parley_types::events::{GatewayCommand, GatewayEvent, ThreadEvent, Topic};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Time a fresh socket gets to send `Identify`.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a single WebSocket connection: Identify handshake, then
/// subscription commands until the client leaves.
pub async fn handle_connection<S: Store>(socket: WebSocket, messenger: Arc<Messenger<S>>) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with a bearer token
    let user = match wait_for_identify(&mut receiver, &messenger).await {
        Some(user) => user,
        None => {
            warn!("WebSocket client failed to identify, closing");
            let _ = sender
                .send(text(&GatewayEvent::Error {
                    code: ChatError::Unauthenticated.code().into(),
                    message: ChatError::Unauthenticated.to_string(),
                }))
                .await;
            return;
        }
    };

    info!("{} ({}) connected to gateway", user.username, user.id);

    // Step 2: Send Ready event
    let ready = GatewayEvent::Ready {
        user_id: user.id,
        username: user.username.clone(),
    };
    if sender.send(text(&ready)).await.is_err() {
        return;
    }

    run_connection_loop(sender, receiver, messenger, user).await;
}

async fn run_connection_loop<S: Store>(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    messenger: Arc<Messenger<S>>,
    user: CurrentUser,
) {
    // Bounded like the fan-out queues: a client that stops reading loses its
    // subscriptions instead of growing this queue.
    let (out_tx, mut out_rx) = mpsc::channel::<GatewayEvent>(messenger.dispatcher().buffer());

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward session events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = out_rx.recv() => {
                    let Some(event) = event else { break };
                    if sender.send(text(&event)).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let username = user.username.clone();
    let user_id = user.id;
    let mut session = Session::new(messenger, user, out_tx);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => session.handle_command(cmd).await,
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            session.user.username,
                            session.user.id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        session
                            .reply_error("BAD_USER_INPUT", format!("Malformed command: {}", e))
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        // Dropping the session cancels its subscriptions.
        drop(session);
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn wait_for_identify<S: Store>(
    receiver: &mut SplitStream<WebSocket>,
    messenger: &Messenger<S>,
) -> Option<CurrentUser> {
    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) = serde_json::from_str::<GatewayCommand>(&text) {
                    return match messenger.identify(Some(&token)).await {
                        Ok(Identity::User(user)) => Some(user),
                        Ok(Identity::Anonymous) => None,
                        Err(e) => {
                            warn!("Gateway identify failed: {}", e);
                            None
                        }
                    };
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

fn text(event: &GatewayEvent) -> Message {
    match serde_json::to_string(event) {
        Ok(json) => Message::Text(json.into()),
        Err(e) => {
            warn!("Failed to encode gateway event: {}", e);
            Message::Text("{}".into())
        }
    }
}

/// Topics one identified connection listens to. Each subscription runs a
/// forwarder task that feeds the connection's outbound queue.
struct Session<S> {
    messenger: Arc<Messenger<S>>,
    user: CurrentUser,
    identity: Identity,
    out: mpsc::Sender<GatewayEvent>,
    subscriptions: HashMap<Topic, (SubscriptionHandle, JoinHandle<()>)>,
}

impl<S: Store> Session<S> {
    fn new(messenger: Arc<Messenger<S>>, user: CurrentUser, out: mpsc::Sender<GatewayEvent>) -> Self {
        Self {
            messenger,
            identity: Identity::User(user.clone()),
            user,
            out,
            subscriptions: HashMap::new(),
        }
    }

    async fn handle_command(&mut self, cmd: GatewayCommand) {
        match cmd {
            GatewayCommand::Identify { .. } => {} // Already handled

            GatewayCommand::SubscribeThread { thread_id } => {
                let topic = Topic::thread(thread_id);
                if self.is_subscribed(topic) {
                    self.reply(GatewayEvent::Subscribed { topic }).await;
                    return;
                }
                match self.messenger.thread_topic(&self.identity, thread_id).await {
                    Ok(sub) => self.attach(sub).await,
                    Err(e) => self.reply_error(e.code(), e.to_string()).await,
                }
            }

            GatewayCommand::SubscribeThreadList => {
                if self.is_subscribed(Topic::ThreadList) {
                    self.reply(GatewayEvent::Subscribed { topic: Topic::ThreadList }).await;
                    return;
                }
                match self.messenger.thread_list_topic(&self.identity) {
                    Ok(sub) => self.attach(sub).await,
                    Err(e) => self.reply_error(e.code(), e.to_string()).await,
                }
            }

            GatewayCommand::UnsubscribeThread { thread_id } => self.detach(Topic::thread(thread_id)).await,

            GatewayCommand::UnsubscribeThreadList => self.detach(Topic::ThreadList).await,
        }
    }

    async fn attach(&mut self, sub: Subscription) {
        let topic = sub.topic();
        let handle = sub.handle();
        let task = tokio::spawn(forward(sub, self.out.clone()));
        self.subscriptions.insert(topic, (handle, task));
        info!("{} ({}) subscribed to {:?}", self.user.username, self.user.id, topic);
        self.reply(GatewayEvent::Subscribed { topic }).await;
    }

    async fn detach(&mut self, topic: Topic) {
        if self.remove(topic) {
            debug!("{} ({}) unsubscribed from {:?}", self.user.username, self.user.id, topic);
        }
        self.reply(GatewayEvent::Unsubscribed { topic }).await;
    }

    async fn reply(&self, event: GatewayEvent) {
        let _ = self.out.send(event).await;
    }

    async fn reply_error(&self, code: &str, message: String) {
        self.reply(GatewayEvent::Error {
            code: code.to_string(),
            message,
        })
        .await;
    }
}

impl<S> Session<S> {
    /// True while `topic` has a live subscription. A lost one is cleared so a
    /// new subscribe can replace it.
    fn is_subscribed(&mut self, topic: Topic) -> bool {
        let live = match self.subscriptions.get(&topic) {
            Some((handle, task)) => handle.is_active() && !task.is_finished(),
            None => return false,
        };
        if !live {
            debug!("{} ({}) replacing lost subscription to {:?}", self.user.username, self.user.id, topic);
            self.remove(topic);
        }
        live
    }

    fn remove(&mut self, topic: Topic) -> bool {
        match self.subscriptions.remove(&topic) {
            Some((handle, task)) => {
                task.abort();
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every subscription of the connection.
    fn close(&mut self) {
        for (_, (handle, task)) in self.subscriptions.drain() {
            task.abort();
            handle.cancel();
        }
    }
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Relays one subscription to the connection. When the dispatcher drops the
/// subscription, or the client falls a full queue behind, the subscription
/// is cancelled and the client told to resync.
async fn forward(mut sub: Subscription, out: mpsc::Sender<GatewayEvent>) {
    let topic = sub.topic();
    while let Some(event) = sub.recv().await {
        match out.try_send(gateway_event(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full, dropping subscription to {:?}", topic);
                break;
            }
            Err(TrySendError::Closed(_)) => return,
        }
    }
    drop(sub);
    let _ = out.send(GatewayEvent::SubscriptionLost { topic }).await;
}

fn gateway_event(event: ThreadEvent) -> GatewayEvent {
    match event {
        ThreadEvent::MessageAdded(message) => GatewayEvent::MessageAdded(message),
        ThreadEvent::ThreadUpdated(thread) => GatewayEvent::ThreadUpdated(thread),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as TtlDuration;
    use parley_core::{Dispatcher, TokenIssuer};
    use parley_db::Database;

    struct Harness {
        messenger: Arc<Messenger<Database>>,
        users: Vec<CurrentUser>,
    }

    fn harness(names: &[&str]) -> Harness {
        harness_with(names, Dispatcher::new())
    }

    fn harness_with(names: &[&str], dispatcher: Dispatcher) -> Harness {
        let db = Database::open_in_memory().unwrap();
        let users = names
            .iter()
            .map(|name| {
                let row = db.create_user(name, "hash").unwrap();
                CurrentUser {
                    id: row.id,
                    username: row.username,
                }
            })
            .collect();
        let messenger = Messenger::new(
            Arc::new(db),
            TokenIssuer::new("test-secret", TtlDuration::days(1)),
            dispatcher,
        );
        Harness {
            messenger: Arc::new(messenger),
            users,
        }
    }

    impl Harness {
        fn session(&self, index: usize) -> (Session<Database>, mpsc::Receiver<GatewayEvent>) {
            self.session_with_queue(index, 64)
        }

        fn session_with_queue(&self, index: usize, capacity: usize) -> (Session<Database>, mpsc::Receiver<GatewayEvent>) {
            let (tx, rx) = mpsc::channel(capacity);
            (Session::new(self.messenger.clone(), self.users[index].clone(), tx), rx)
        }

        fn identity(&self, index: usize) -> Identity {
            Identity::User(self.users[index].clone())
        }
    }

    async fn next(rx: &mut mpsc::Receiver<GatewayEvent>) -> GatewayEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for gateway event")
            .expect("session channel closed")
    }

    #[tokio::test]
    async fn thread_subscription_relays_new_messages() {
        let h = harness(&["alice", "bob"]);
        let thread = h.messenger.create_thread(&h.identity(0), "bob").await.unwrap();
        let (mut session, mut rx) = h.session(1);

        session.handle_command(GatewayCommand::SubscribeThread { thread_id: thread.id }).await;
        assert!(matches!(next(&mut rx).await, GatewayEvent::Subscribed { topic } if topic == Topic::thread(thread.id)));

        let sent = h.messenger.send_message(&h.identity(0), thread.id, "hi").await.unwrap();
        match next(&mut rx).await {
            GatewayEvent::MessageAdded(message) => assert_eq!(message, sent),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn outsiders_get_an_error_instead_of_a_subscription() {
        let h = harness(&["alice", "bob", "mallory"]);
        let thread = h.messenger.create_thread(&h.identity(0), "bob").await.unwrap();
        let (mut session, mut rx) = h.session(2);

        session.handle_command(GatewayCommand::SubscribeThread { thread_id: thread.id }).await;
        match next(&mut rx).await {
            GatewayEvent::Error { code, .. } => assert_eq!(code, "NOT_FOUND"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(h.messenger.dispatcher().subscriber_count(Topic::thread(thread.id)), 0);
    }

    #[tokio::test]
    async fn thread_list_only_shows_own_threads() {
        let h = harness(&["alice", "bob", "carol"]);
        let (mut session, mut rx) = h.session(2);
        session.handle_command(GatewayCommand::SubscribeThreadList).await;
        assert!(matches!(next(&mut rx).await, GatewayEvent::Subscribed { topic: Topic::ThreadList }));

        let private = h.messenger.create_thread(&h.identity(0), "bob").await.unwrap();
        h.messenger.send_message(&h.identity(0), private.id, "secret").await.unwrap();
        let shared = h.messenger.create_thread(&h.identity(0), "carol").await.unwrap();

        match next(&mut rx).await {
            GatewayEvent::ThreadUpdated(thread) => assert_eq!(thread.id, shared.id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn unsubscribe_and_close_release_registry_entries() {
        let h = harness(&["alice", "bob"]);
        let thread = h.messenger.create_thread(&h.identity(0), "bob").await.unwrap();
        let topic = Topic::thread(thread.id);
        let dispatcher = h.messenger.dispatcher().clone();
        let (mut session, mut rx) = h.session(0);

        session.handle_command(GatewayCommand::SubscribeThread { thread_id: thread.id }).await;
        session.handle_command(GatewayCommand::SubscribeThreadList).await;
        assert_eq!(dispatcher.subscriber_count(topic), 1);

        session.handle_command(GatewayCommand::UnsubscribeThread { thread_id: thread.id }).await;
        assert_eq!(dispatcher.subscriber_count(topic), 0);
        assert_eq!(dispatcher.subscriber_count(Topic::ThreadList), 1);

        session.close();
        assert_eq!(dispatcher.subscriber_count(Topic::ThreadList), 0);

        let mut replies = Vec::new();
        while let Ok(event) = rx.try_recv() {
            replies.push(event);
        }
        assert!(matches!(replies.last(), Some(GatewayEvent::Unsubscribed { .. })));
    }

    #[test]
    fn commands_parse_from_tagged_json() {
        let cmd: GatewayCommand =
            serde_json::from_str(r#"{"type":"SubscribeThread","data":{"thread_id":4}}"#).unwrap();
        assert!(matches!(cmd, GatewayCommand::SubscribeThread { thread_id: 4 }));
        let cmd: GatewayCommand = serde_json::from_str(r#"{"type":"SubscribeThreadList"}"#).unwrap();
        assert!(matches!(cmd, GatewayCommand::SubscribeThreadList));
    }

    async fn wait_for_count(dispatcher: &Dispatcher, topic: Topic, expected: usize) {
        for _ in 0..200 {
            if dispatcher.subscriber_count(topic) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(dispatcher.subscriber_count(topic), expected);
    }

    #[tokio::test]
    async fn resubscribe_after_lost_subscription_registers_again() {
        let h = harness_with(&["alice", "bob"], Dispatcher::with_buffer(1));
        let thread = h.messenger.create_thread(&h.identity(0), "bob").await.unwrap();
        let topic = Topic::thread(thread.id);
        let dispatcher = h.messenger.dispatcher().clone();
        let (mut session, mut rx) = h.session(1);

        session.handle_command(GatewayCommand::SubscribeThread { thread_id: thread.id }).await;
        assert!(matches!(next(&mut rx).await, GatewayEvent::Subscribed { .. }));

        // Two publishes before the forwarder runs overflow its queue of one.
        for id in [101, 102] {
            let message = parley_types::models::Message {
                id,
                thread_id: thread.id,
                sender: thread.participants[0].clone(),
                content: format!("burst {id}"),
                created_at: chrono::Utc::now(),
            };
            dispatcher.publish(topic, ThreadEvent::MessageAdded(message));
        }
        assert!(matches!(next(&mut rx).await, GatewayEvent::MessageAdded(m) if m.id == 101));
        assert!(matches!(next(&mut rx).await, GatewayEvent::SubscriptionLost { topic: lost } if lost == topic));

        session.handle_command(GatewayCommand::SubscribeThread { thread_id: thread.id }).await;
        assert!(matches!(next(&mut rx).await, GatewayEvent::Subscribed { .. }));
        assert_eq!(dispatcher.subscriber_count(topic), 1);

        let sent = h.messenger.send_message(&h.identity(0), thread.id, "after resync").await.unwrap();
        match next(&mut rx).await {
            GatewayEvent::MessageAdded(message) => assert_eq!(message, sent),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn client_that_stops_reading_loses_the_subscription() {
        let h = harness(&["alice", "bob"]);
        let thread = h.messenger.create_thread(&h.identity(0), "bob").await.unwrap();
        let topic = Topic::thread(thread.id);
        let dispatcher = h.messenger.dispatcher().clone();
        let (mut session, mut rx) = h.session_with_queue(1, 2);

        session.handle_command(GatewayCommand::SubscribeThread { thread_id: thread.id }).await;
        let first = h.messenger.send_message(&h.identity(0), thread.id, "one").await.unwrap();
        h.messenger.send_message(&h.identity(0), thread.id, "two").await.unwrap();

        wait_for_count(&dispatcher, topic, 0).await;

        assert!(matches!(next(&mut rx).await, GatewayEvent::Subscribed { .. }));
        match next(&mut rx).await {
            GatewayEvent::MessageAdded(message) => assert_eq!(message, first),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(next(&mut rx).await, GatewayEvent::SubscriptionLost { topic: lost } if lost == topic));
    }
}
