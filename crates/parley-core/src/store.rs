use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::error;

use parley_db::Database;
use parley_db::models::{MessageRow, ParticipantRow, ThreadRow, UserRow};
use parley_db::{format_timestamp, is_constraint_violation, parse_timestamp};
use parley_types::models::{Message, Thread, ThreadId, User, UserId};

use crate::error::ChatError;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("conflicting write")]
    Conflict,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence the engine depends on. Calls are blocking; the engine runs
/// them on the blocking pool via [`run_blocking`].
pub trait Store: Send + Sync + 'static {
    fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>>;

    fn find_user_by_id(&self, id: UserId) -> StoreResult<Option<User>>;

    /// Order of `a` and `b` is irrelevant.
    fn find_thread_by_participant_pair(&self, a: UserId, b: UserId) -> StoreResult<Option<Thread>>;

    /// Creates the thread for {a, b} with both participant links, or returns
    /// the existing one. Atomic with respect to concurrent calls for the same
    /// pair; the flag is true only for the call that created it.
    fn create_thread_with_participants(&self, a: UserId, b: UserId) -> StoreResult<(Thread, bool)>;

    /// Most recently active first, each with its latest message as preview.
    fn list_threads_for_user(&self, user_id: UserId) -> StoreResult<Vec<Thread>>;

    fn get_thread_with_messages(&self, thread_id: ThreadId) -> StoreResult<Option<Thread>>;

    /// The thread with only its latest message attached.
    fn get_thread_with_preview(&self, thread_id: ThreadId) -> StoreResult<Option<Thread>>;

    fn list_messages(&self, thread_id: ThreadId) -> StoreResult<Vec<Message>>;

    fn is_participant(&self, thread_id: ThreadId, user_id: UserId) -> StoreResult<bool>;

    /// Persists a message. Stores that can should advance the thread's last
    /// activity in the same write; `touch_thread` is still called afterwards.
    fn append_message(&self, thread_id: ThreadId, sender_id: UserId, content: &str) -> StoreResult<Message>;

    fn touch_thread(&self, thread_id: ThreadId, at: DateTime<Utc>) -> StoreResult<()>;
}

/// Runs a store call off the async runtime.
pub(crate) async fn run_blocking<S, T, F>(store: &Arc<S>, f: F) -> Result<T, ChatError>
where
    S: Store,
    T: Send + 'static,
    F: FnOnce(&S) -> StoreResult<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ChatError::Unavailable(anyhow::anyhow!("store task failed: {}", e))
        })?
        .map_err(ChatError::from)
}

fn backend(err: anyhow::Error) -> StoreError {
    if is_constraint_violation(&err) {
        StoreError::Conflict
    } else {
        StoreError::Backend(err)
    }
}

impl Store for Database {
    fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let row = self.get_user_by_username(username).map_err(backend)?;
        Ok(row.map(|r| user_from_row(&r)).transpose()?)
    }

    fn find_user_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        let row = self.get_user_by_id(id).map_err(backend)?;
        Ok(row.map(|r| user_from_row(&r)).transpose()?)
    }

    fn find_thread_by_participant_pair(&self, a: UserId, b: UserId) -> StoreResult<Option<Thread>> {
        match self.find_thread_by_pair(a, b).map_err(backend)? {
            Some(row) => Ok(self.get_thread_with_preview(row.id)?),
            None => Ok(None),
        }
    }

    fn create_thread_with_participants(&self, a: UserId, b: UserId) -> StoreResult<(Thread, bool)> {
        let (row, created) = self.create_thread_for_pair(a, b).map_err(backend)?;
        let mut threads = assemble_threads(self, vec![row], Vec::new())?;
        let thread = threads
            .pop()
            .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("thread vanished after creation")))?;
        Ok((thread, created))
    }

    fn list_threads_for_user(&self, user_id: UserId) -> StoreResult<Vec<Thread>> {
        let rows = Database::list_threads_for_user(self, user_id).map_err(backend)?;
        let previews = self.latest_messages_for_user(user_id).map_err(backend)?;
        Ok(assemble_threads(self, rows, previews)?)
    }

    fn get_thread_with_messages(&self, thread_id: ThreadId) -> StoreResult<Option<Thread>> {
        let Some(row) = self.get_thread(thread_id).map_err(backend)? else {
            return Ok(None);
        };
        let messages = self.get_messages(thread_id).map_err(backend)?;
        Ok(assemble_threads(self, vec![row], messages)?.pop())
    }

    fn get_thread_with_preview(&self, thread_id: ThreadId) -> StoreResult<Option<Thread>> {
        let Some(row) = self.get_thread(thread_id).map_err(backend)? else {
            return Ok(None);
        };
        let preview: Vec<MessageRow> = self.latest_message(thread_id).map_err(backend)?.into_iter().collect();
        Ok(assemble_threads(self, vec![row], preview)?.pop())
    }

    fn list_messages(&self, thread_id: ThreadId) -> StoreResult<Vec<Message>> {
        let rows = self.get_messages(thread_id).map_err(backend)?;
        Ok(rows.iter().map(message_from_row).collect::<anyhow::Result<Vec<_>>>()?)
    }

    fn is_participant(&self, thread_id: ThreadId, user_id: UserId) -> StoreResult<bool> {
        Database::is_participant(self, thread_id, user_id).map_err(backend)
    }

    fn append_message(&self, thread_id: ThreadId, sender_id: UserId, content: &str) -> StoreResult<Message> {
        let row = self.insert_message(thread_id, sender_id, content).map_err(backend)?;
        Ok(message_from_row(&row)?)
    }

    fn touch_thread(&self, thread_id: ThreadId, at: DateTime<Utc>) -> StoreResult<()> {
        Database::touch_thread(self, thread_id, &format_timestamp(at)).map_err(backend)?;
        Ok(())
    }
}

/// Attaches participants and the given messages to thread rows, keeping the
/// order of `rows` and of `messages`.
fn assemble_threads(db: &Database, rows: Vec<ThreadRow>, messages: Vec<MessageRow>) -> anyhow::Result<Vec<Thread>> {
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let participant_rows = db.get_participants(&ids)?;

    let mut participants: HashMap<i64, Vec<User>> = HashMap::new();
    for p in &participant_rows {
        participants.entry(p.thread_id).or_default().push(participant_from_row(p)?);
    }

    let mut by_thread: HashMap<i64, Vec<Message>> = HashMap::new();
    for m in &messages {
        by_thread.entry(m.thread_id).or_default().push(message_from_row(m)?);
    }

    rows.into_iter()
        .map(|row| {
            Ok(Thread {
                id: row.id,
                participants: participants.remove(&row.id).unwrap_or_default(),
                messages: by_thread.remove(&row.id).unwrap_or_default(),
                created_at: timestamp(&row.created_at, "thread created_at")?,
                updated_at: timestamp(&row.updated_at, "thread updated_at")?,
            })
        })
        .collect()
}

fn timestamp(raw: &str, what: &str) -> anyhow::Result<DateTime<Utc>> {
    parse_timestamp(raw).with_context(|| format!("corrupt {} '{}'", what, raw))
}

fn user_from_row(row: &UserRow) -> anyhow::Result<User> {
    Ok(User {
        id: row.id,
        username: row.username.clone(),
        created_at: timestamp(&row.created_at, "user created_at")?,
        updated_at: timestamp(&row.updated_at, "user updated_at")?,
    })
}

fn participant_from_row(row: &ParticipantRow) -> anyhow::Result<User> {
    Ok(User {
        id: row.user_id,
        username: row.username.clone(),
        created_at: timestamp(&row.created_at, "user created_at")?,
        updated_at: timestamp(&row.updated_at, "user updated_at")?,
    })
}

fn message_from_row(row: &MessageRow) -> anyhow::Result<Message> {
    Ok(Message {
        id: row.id,
        thread_id: row.thread_id,
        sender: User {
            id: row.sender_id,
            username: row.sender_username.clone(),
            created_at: timestamp(&row.sender_created_at, "user created_at")?,
            updated_at: timestamp(&row.sender_updated_at, "user updated_at")?,
        },
        content: row.content.clone(),
        created_at: timestamp(&row.created_at, "message created_at")?,
    })
}
