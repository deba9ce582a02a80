use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use parley_types::events::{ThreadEvent, Topic};
use parley_types::models::{Message, ThreadId, UserId};

use crate::error::ChatError;
use crate::fanout::Dispatcher;
use crate::guard::AccessGuard;
use crate::identity::Identity;
use crate::store::{Store, run_blocking};

type Sequencers = Arc<DashMap<ThreadId, Arc<Mutex<()>>>>;

/// Append-only message log per thread.
pub struct MessageLedger<S> {
    store: Arc<S>,
    guard: AccessGuard<S>,
    dispatcher: Dispatcher,
    /// One writer at a time per thread, held from append through publish, so
    /// notifications leave in the same order the store assigned.
    sequencers: Sequencers,
}

impl<S: Store> MessageLedger<S> {
    pub fn new(store: Arc<S>, guard: AccessGuard<S>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            guard,
            dispatcher,
            sequencers: Arc::new(DashMap::new()),
        }
    }

    /// Every message of the thread, oldest first.
    pub async fn list_messages(&self, identity: &Identity, thread_id: ThreadId) -> Result<Vec<Message>, ChatError> {
        self.guard.authorize(identity, thread_id).await?;
        run_blocking(&self.store, move |store| store.list_messages(thread_id)).await
    }

    /// Persists a message from the caller and notifies subscribers of the
    /// thread and of the thread list.
    ///
    /// The returned message is authoritative once persisted; failures after
    /// that point (activity timestamp, notifications) are logged, not
    /// returned. The write and its notifications run on their own task, so a
    /// caller that goes away mid-send cannot leave a persisted message
    /// unannounced.
    pub async fn send_message(
        &self,
        identity: &Identity,
        thread_id: ThreadId,
        content: &str,
    ) -> Result<Message, ChatError> {
        let sender = self.guard.authorize(identity, thread_id).await?;
        if content.trim().is_empty() {
            return Err(ChatError::bad_input("Message content cannot be empty"));
        }

        let append = Append {
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            sequencers: self.sequencers.clone(),
            thread_id,
            sender_id: sender.id,
            content: content.to_string(),
        };
        let message = tokio::spawn(append.run()).await.map_err(|e| {
            error!("Append task for thread {} failed: {}", thread_id, e);
            ChatError::Unavailable(anyhow::anyhow!("append task failed: {}", e))
        })??;

        debug!("{} posted message {} to thread {}", sender.username, message.id, thread_id);
        Ok(message)
    }
}

/// One accepted send, from the sequencer turn to the last notification.
struct Append<S> {
    store: Arc<S>,
    dispatcher: Dispatcher,
    sequencers: Sequencers,
    thread_id: ThreadId,
    sender_id: UserId,
    content: String,
}

impl<S: Store> Append<S> {
    async fn run(self) -> Result<Message, ChatError> {
        let thread_id = self.thread_id;
        let sequencer = self
            .sequencers
            .entry(thread_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let turn = sequencer.lock().await;

        let sender_id = self.sender_id;
        let body = self.content.clone();
        let appended = run_blocking(&self.store, move |store| store.append_message(thread_id, sender_id, &body)).await;
        if let Ok(message) = &appended {
            self.announce(message).await;
        }

        drop(turn);
        drop(sequencer);
        self.sequencers
            .remove_if(&thread_id, |_, lock| Arc::strong_count(lock) == 1);

        appended
    }

    async fn announce(&self, message: &Message) {
        let thread_id = message.thread_id;
        let at = message.created_at;
        if let Err(e) = run_blocking(&self.store, move |store| store.touch_thread(thread_id, at)).await {
            error!("Failed to update activity of thread {}: {}", thread_id, e);
        }

        self.dispatcher
            .publish(Topic::thread(thread_id), ThreadEvent::MessageAdded(message.clone()));

        match run_blocking(&self.store, move |store| store.get_thread_with_preview(thread_id)).await {
            Ok(Some(thread)) => {
                self.dispatcher
                    .publish(Topic::ThreadList, ThreadEvent::ThreadUpdated(thread));
            }
            Ok(None) => warn!("Thread {} disappeared after append", thread_id),
            Err(e) => warn!("Skipping thread-list update for {}: {}", thread_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    use crate::directory::ThreadDirectory;
    use crate::testing::{FaultyStore, seeded};
    use parley_db::{Database, parse_timestamp};

    struct Fixture {
        ledger: Arc<MessageLedger<Database>>,
        dispatcher: Dispatcher,
        ids: Vec<Identity>,
        thread_id: ThreadId,
    }

    async fn fixture() -> Fixture {
        let (db, ids) = seeded(&["alice", "bob", "mallory"]);
        let dispatcher = Dispatcher::new();
        let guard = AccessGuard::new(db.clone());
        let directory = ThreadDirectory::new(db.clone(), guard.clone(), dispatcher.clone());
        let thread_id = directory.create_thread(&ids[0], "bob").await.unwrap().id;
        Fixture {
            ledger: Arc::new(MessageLedger::new(db, guard, dispatcher.clone())),
            dispatcher,
            ids,
            thread_id,
        }
    }

    #[tokio::test]
    async fn alice_and_bob_exchange_messages() {
        let f = fixture().await;

        let hi = f.ledger.send_message(&f.ids[0], f.thread_id, "hi").await.unwrap();
        let hello = f.ledger.send_message(&f.ids[1], f.thread_id, "hello").await.unwrap();
        assert_eq!((hi.id, hello.id), (1, 2));
        assert_eq!(hi.sender.username, "alice");
        assert_eq!(hello.thread_id, f.thread_id);

        let listed = f.ledger.list_messages(&f.ids[0], f.thread_id).await.unwrap();
        assert_eq!(listed, vec![hi, hello]);
        assert_eq!(f.ledger.list_messages(&f.ids[1], f.thread_id).await.unwrap(), listed);
    }

    #[tokio::test]
    async fn blank_messages_are_rejected_and_not_stored() {
        let f = fixture().await;

        for content in ["", "   ", "\n\t"] {
            let err = f.ledger.send_message(&f.ids[0], f.thread_id, content).await.unwrap_err();
            assert!(matches!(err, ChatError::BadInput(_)));
        }
        assert!(f.ledger.list_messages(&f.ids[0], f.thread_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outsiders_cannot_read_or_write() {
        let f = fixture().await;
        let mallory = &f.ids[2];

        let err = f.ledger.send_message(mallory, f.thread_id, "let me in").await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound("Thread")));
        let err = f.ledger.list_messages(mallory, f.thread_id).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound("Thread")));
        let err = f.ledger.send_message(&Identity::Anonymous, f.thread_id, "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthenticated));

        assert!(f.ledger.list_messages(&f.ids[0], f.thread_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribers_before_a_send_are_notified_once() {
        let f = fixture().await;
        let mut thread_sub = f.dispatcher.subscribe(Topic::thread(f.thread_id));
        let mut list_sub = f.dispatcher.subscribe(Topic::ThreadList);

        let sent = f.ledger.send_message(&f.ids[0], f.thread_id, "hi").await.unwrap();
        let mut late = f.dispatcher.subscribe(Topic::thread(f.thread_id));

        assert_eq!(thread_sub.try_recv(), Some(ThreadEvent::MessageAdded(sent.clone())));
        assert!(thread_sub.try_recv().is_none());
        assert!(late.try_recv().is_none());

        match list_sub.try_recv() {
            Some(ThreadEvent::ThreadUpdated(thread)) => {
                assert_eq!(thread.id, f.thread_id);
                assert_eq!(thread.messages, vec![sent.clone()]);
                assert!(thread.updated_at >= sent.created_at);
            }
            other => panic!("expected thread update, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_senders_resolve_to_one_order() {
        let f = fixture().await;
        let mut sub = f.dispatcher.subscribe(Topic::thread(f.thread_id));
        const N: usize = 40;

        let mut tasks = Vec::new();
        for i in 0..N {
            let ledger = f.ledger.clone();
            let sender = f.ids[i % 2].clone();
            let thread_id = f.thread_id;
            tasks.push(tokio::spawn(async move {
                ledger.send_message(&sender, thread_id, &format!("msg {i}")).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let first = f.ledger.list_messages(&f.ids[0], f.thread_id).await.unwrap();
        let second = f.ledger.list_messages(&f.ids[1], f.thread_id).await.unwrap();
        assert_eq!(first.len(), N);
        assert_eq!(first, second);
        assert!(
            first
                .windows(2)
                .all(|w| (w[0].created_at, w[0].id) < (w[1].created_at, w[1].id))
        );

        let mut delivered = Vec::new();
        while let Some(ThreadEvent::MessageAdded(m)) = sub.try_recv() {
            delivered.push(m.id);
        }
        let stored: Vec<_> = first.iter().map(|m| m.id).collect();
        assert_eq!(delivered, stored);
    }

    #[tokio::test]
    async fn sending_moves_the_thread_to_the_top() {
        let (db, ids) = seeded(&["alice", "bob", "carol"]);
        let dispatcher = Dispatcher::new();
        let guard = AccessGuard::new(db.clone());
        let directory = ThreadDirectory::new(db.clone(), guard.clone(), dispatcher.clone());
        let ledger = MessageLedger::new(db, guard, dispatcher);

        let with_bob = directory.create_thread(&ids[0], "bob").await.unwrap();
        let with_carol = directory.create_thread(&ids[0], "carol").await.unwrap();
        ledger.send_message(&ids[1], with_bob.id, "ping").await.unwrap();

        let listed = directory.list_threads(&ids[0]).await.unwrap();
        let order: Vec<_> = listed.iter().map(|t| t.id).collect();
        assert_eq!(order, vec![with_bob.id, with_carol.id]);
        assert_eq!(listed[0].messages[0].content, "ping");
        assert!(listed[1].messages.is_empty());
    }

    /// Ledger over a store wrapper, with alice (0) and bob (1) sharing a
    /// thread.
    fn faulty(
        dispatcher: Dispatcher,
        configure: impl FnOnce(&mut FaultyStore),
    ) -> (Arc<MessageLedger<FaultyStore>>, Arc<Database>, Vec<Identity>, ThreadId) {
        let (db, ids) = seeded(&["alice", "bob"]);
        let (thread, _) = db
            .create_thread_for_pair(ids[0].user().unwrap().id, ids[1].user().unwrap().id)
            .unwrap();
        let mut store = FaultyStore::new(db.clone());
        configure(&mut store);
        let store = Arc::new(store);
        let ledger = MessageLedger::new(store.clone(), AccessGuard::new(store), dispatcher);
        (Arc::new(ledger), db, ids, thread.id)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_send_still_touches_and_notifies() {
        let gate = Arc::new(Barrier::new(2));
        let dispatcher = Dispatcher::new();
        let (ledger, db, ids, thread_id) = faulty(dispatcher.clone(), |store| {
            store.append_gate = Some(gate.clone());
        });
        let mut sub = dispatcher.subscribe(Topic::thread(thread_id));

        let sender = ids[0].clone();
        let sending = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.send_message(&sender, thread_id, "hi").await })
        };

        let landed = gate.clone();
        tokio::task::spawn_blocking(move || landed.wait()).await.unwrap();
        sending.abort();
        assert!(sending.await.unwrap_err().is_cancelled());
        let release = gate.clone();
        tokio::task::spawn_blocking(move || release.wait()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("no notification for the persisted message");
        let message = match event {
            Some(ThreadEvent::MessageAdded(message)) => message,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(message.content, "hi");

        let row = db.get_thread(thread_id).unwrap().unwrap();
        assert!(parse_timestamp(&row.updated_at).unwrap() >= message.created_at);

        for _ in 0..200 {
            if ledger.sequencers.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ledger.sequencers.is_empty());
    }

    #[tokio::test]
    async fn failed_touch_does_not_fail_the_send() {
        let dispatcher = Dispatcher::new();
        let (ledger, _db, ids, thread_id) = faulty(dispatcher.clone(), |store| store.fail_touch = true);
        let mut sub = dispatcher.subscribe(Topic::thread(thread_id));

        let sent = ledger.send_message(&ids[0], thread_id, "still here").await.unwrap();

        assert_eq!(ledger.list_messages(&ids[1], thread_id).await.unwrap(), vec![sent.clone()]);
        assert_eq!(sub.try_recv(), Some(ThreadEvent::MessageAdded(sent)));
    }

    #[tokio::test]
    async fn lagging_and_cancelled_subscribers_never_fail_a_send() {
        let dispatcher = Dispatcher::with_buffer(1);
        let (ledger, _db, ids, thread_id) = faulty(dispatcher.clone(), |_| {});
        let topic = Topic::thread(thread_id);
        let _slow_thread = dispatcher.subscribe(topic);
        let _slow_list = dispatcher.subscribe(Topic::ThreadList);
        dispatcher.subscribe(topic).handle().cancel();

        for content in ["one", "two", "three"] {
            ledger.send_message(&ids[0], thread_id, content).await.unwrap();
        }

        assert_eq!(dispatcher.subscriber_count(topic), 0);
        assert_eq!(dispatcher.subscriber_count(Topic::ThreadList), 0);
        assert_eq!(ledger.list_messages(&ids[1], thread_id).await.unwrap().len(), 3);
    }
}
