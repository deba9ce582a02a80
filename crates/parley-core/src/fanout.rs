use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use parley_types::events::{ThreadEvent, Topic};
use parley_types::models::UserId;

/// Per-subscriber queue depth. A subscriber that falls this far behind is
/// dropped and has to re-read from the store.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

/// Topic registry for real-time updates.
///
/// Best effort only: the store stays authoritative, nothing is replayed, and
/// a failed delivery never reaches the publisher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// topic -> (subscriber id -> sender). A publish holds the topic's shard
    /// entry for the whole delivery, so it is atomic against subscribe and
    /// unsubscribe on that topic while other topics proceed.
    topics: DashMap<Topic, HashMap<Uuid, mpsc::Sender<ThreadEvent>>>,
    buffer: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                topics: DashMap::new(),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Registers a subscriber. It sees every publish that starts after this
    /// returns, and none before.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        self.inner.topics.entry(topic).or_default().insert(id, tx);
        debug!("Subscriber {} joined {:?}", id, topic);

        Subscription {
            handle: SubscriptionHandle {
                id,
                topic,
                registry: Arc::downgrade(&self.inner),
            },
            rx,
            viewer: None,
        }
    }

    /// Delivers `event` once to every subscriber of `topic`, returning how
    /// many accepted it. Full or closed subscribers are deregistered.
    pub fn publish(&self, topic: Topic, event: ThreadEvent) -> usize {
        let mut delivered = 0;
        let now_empty = {
            let Some(mut subscribers) = self.inner.topics.get_mut(&topic) else {
                trace!("No subscribers for {:?}", topic);
                return 0;
            };

            subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} on {:?} is lagging, dropping it", id, topic);
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} on {:?} went away", id, topic);
                    false
                }
            });
            subscribers.is_empty()
        };

        if now_empty {
            self.inner.topics.remove_if(&topic, |_, subs| subs.is_empty());
        }

        trace!("Published to {:?}: {} delivered", topic, delivered);
        delivered
    }

    /// Queue depth given to each subscriber.
    pub fn buffer(&self) -> usize {
        self.inner.buffer
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner.topics.get(&topic).map_or(0, |subs| subs.len())
    }
}

fn unsubscribe(inner: &DispatcherInner, topic: Topic, id: Uuid) {
    let now_empty = match inner.topics.get_mut(&topic) {
        Some(mut subscribers) => {
            if subscribers.remove(&id).is_some() {
                debug!("Subscriber {} left {:?}", id, topic);
            }
            subscribers.is_empty()
        }
        None => false,
    };
    if now_empty {
        inner.topics.remove_if(&topic, |_, subs| subs.is_empty());
    }
}

/// Detached cancel token for a [`Subscription`], usable while another task
/// owns the receiving end.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: Uuid,
    topic: Topic,
    registry: Weak<DispatcherInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// False once the subscription was cancelled or dropped for lagging.
    pub fn is_active(&self) -> bool {
        self.registry.upgrade().is_some_and(|inner| {
            inner
                .topics
                .get(&self.topic)
                .is_some_and(|subscribers| subscribers.contains_key(&self.id))
        })
    }

    /// Deregisters immediately: no publish that starts after this returns
    /// reaches the subscription. Idempotent.
    pub fn cancel(&self) {
        if let Some(inner) = self.registry.upgrade() {
            unsubscribe(&inner, self.topic, self.id);
        }
    }
}

/// Receiving end of a topic. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    rx: mpsc::Receiver<ThreadEvent>,
    /// When set, thread updates for threads this user is not part of are
    /// skipped.
    viewer: Option<UserId>,
}

impl Subscription {
    /// Restricts thread updates to threads `user_id` participates in.
    pub fn visible_to(mut self, user_id: UserId) -> Self {
        self.viewer = Some(user_id);
        self
    }
    pub fn topic(&self) -> Topic {
        self.handle.topic
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// Next event in publish order. `None` once the subscription was
    /// cancelled or dropped by the dispatcher and the queue is drained.
    pub async fn recv(&mut self) -> Option<ThreadEvent> {
        loop {
            let event = self.rx.recv().await?;
            if self.is_visible(&event) {
                return Some(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ThreadEvent> {
        loop {
            let event = self.rx.try_recv().ok()?;
            if self.is_visible(&event) {
                return Some(event);
            }
        }
    }

    fn is_visible(&self, event: &ThreadEvent) -> bool {
        match (event, self.viewer) {
            (ThreadEvent::ThreadUpdated(thread), Some(user_id)) => thread.has_participant(user_id),
            _ => true,
        }
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}
