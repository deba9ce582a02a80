use std::sync::{Arc, Barrier};

use chrono::{DateTime, Utc};
use parley_db::Database;
use parley_types::models::{Message, Thread, ThreadId, User, UserId};

use crate::identity::{CurrentUser, Identity};
use crate::store::{Store, StoreError, StoreResult};

/// In-memory database seeded with `names`; identities come back in the same
/// order.
pub fn seeded(names: &[&str]) -> (Arc<Database>, Vec<Identity>) {
    let db = Database::open_in_memory().unwrap();
    let identities = names
        .iter()
        .map(|name| {
            let row = db.create_user(name, "hash").unwrap();
            Identity::User(CurrentUser {
                id: row.id,
                username: row.username,
            })
        })
        .collect();
    (Arc::new(db), identities)
}

/// Delegates to a [`Database`], with optional failures and pauses injected.
pub struct FaultyStore {
    pub db: Arc<Database>,
    pub fail_touch: bool,
    /// Waited on twice after each append: once to signal the write landed,
    /// once to be released.
    pub append_gate: Option<Arc<Barrier>>,
}

impl FaultyStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            fail_touch: false,
            append_gate: None,
        }
    }
}

impl Store for FaultyStore {
    fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        Store::find_user_by_username(self.db.as_ref(), username)
    }

    fn find_user_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        Store::find_user_by_id(self.db.as_ref(), id)
    }

    fn find_thread_by_participant_pair(&self, a: UserId, b: UserId) -> StoreResult<Option<Thread>> {
        Store::find_thread_by_participant_pair(self.db.as_ref(), a, b)
    }

    fn create_thread_with_participants(&self, a: UserId, b: UserId) -> StoreResult<(Thread, bool)> {
        Store::create_thread_with_participants(self.db.as_ref(), a, b)
    }

    fn list_threads_for_user(&self, user_id: UserId) -> StoreResult<Vec<Thread>> {
        Store::list_threads_for_user(self.db.as_ref(), user_id)
    }

    fn get_thread_with_messages(&self, thread_id: ThreadId) -> StoreResult<Option<Thread>> {
        Store::get_thread_with_messages(self.db.as_ref(), thread_id)
    }

    fn get_thread_with_preview(&self, thread_id: ThreadId) -> StoreResult<Option<Thread>> {
        Store::get_thread_with_preview(self.db.as_ref(), thread_id)
    }

    fn list_messages(&self, thread_id: ThreadId) -> StoreResult<Vec<Message>> {
        Store::list_messages(self.db.as_ref(), thread_id)
    }

    fn is_participant(&self, thread_id: ThreadId, user_id: UserId) -> StoreResult<bool> {
        Store::is_participant(self.db.as_ref(), thread_id, user_id)
    }

    fn append_message(&self, thread_id: ThreadId, sender_id: UserId, content: &str) -> StoreResult<Message> {
        let message = Store::append_message(self.db.as_ref(), thread_id, sender_id, content)?;
        if let Some(gate) = &self.append_gate {
            gate.wait();
            gate.wait();
        }
        Ok(message)
    }

    fn touch_thread(&self, thread_id: ThreadId, at: DateTime<Utc>) -> StoreResult<()> {
        if self.fail_touch {
            return Err(StoreError::Backend(anyhow::anyhow!("disk I/O error")));
        }
        Store::touch_thread(self.db.as_ref(), thread_id, at)
    }
}
