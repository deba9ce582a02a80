use serde::{Deserialize, Serialize};

use crate::models::{Message, Thread, ThreadId, UserId};

/// A fan-out topic: one per thread, plus the global thread list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topic {
    Thread { thread_id: ThreadId },
    ThreadList,
}

impl Topic {
    pub fn thread(thread_id: ThreadId) -> Self {
        Self::Thread { thread_id }
    }
}

/// Payload published to fan-out subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ThreadEvent {
    /// A message was accepted into a thread (thread topic).
    MessageAdded(Message),

    /// A thread's last activity changed (thread-list topic). Carries the
    /// latest message as preview.
    ThreadUpdated(Thread),
}

impl ThreadEvent {
    pub fn thread_id(&self) -> ThreadId {
        match self {
            Self::MessageAdded(message) => message.thread_id,
            Self::ThreadUpdated(thread) => thread.id,
        }
    }
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: UserId, username: String },

    /// Subscription accepted
    Subscribed { topic: Topic },

    /// Subscription removed on request
    Unsubscribed { topic: Topic },

    /// A new message in a subscribed thread
    MessageAdded(Message),

    /// A thread the user participates in had activity
    ThreadUpdated(Thread),

    /// The server dropped this subscription (lagging client). Re-read over
    /// HTTP and subscribe again.
    SubscriptionLost { topic: Topic },

    /// A command was rejected
    Error { code: String, message: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Receive new messages of one thread
    SubscribeThread { thread_id: ThreadId },

    UnsubscribeThread { thread_id: ThreadId },

    /// Receive activity for every thread the user participates in
    SubscribeThreadList,

    UnsubscribeThreadList,
}
