use crate::models::{MessageRow, ParticipantRow, ThreadRow, UserRow};
use crate::{Database, format_timestamp, is_constraint_violation};
use anyhow::{Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

const MESSAGE_SELECT: &str = "SELECT m.id, m.thread_id, m.sender_id, u.username, u.created_at, u.updated_at, m.content, m.created_at
     FROM messages m
     JOIN users u ON m.sender_id = u.id";

impl Database {
    // -- Users --

    pub fn create_user(&self, username: &str, password_hash: &str) -> Result<UserRow> {
        self.with_conn(|conn| {
            let now = format_timestamp(Utc::now());
            conn.execute(
                "INSERT INTO users (username, password, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                (username, password_hash, &now),
            )?;
            Ok(UserRow {
                id: conn.last_insert_rowid(),
                username: username.to_string(),
                password: password_hash.to_string(),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", &username))
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", &id))
    }

    // -- Threads --

    pub fn find_thread_by_pair(&self, a: i64, b: i64) -> Result<Option<ThreadRow>> {
        let (low, high) = canonical_pair(a, b);
        self.with_conn(|conn| query_thread_by_pair(conn, low, high))
    }

    /// Returns the thread for the pair {a, b}, creating it together with both
    /// participant links when absent. The flag is true when this call created
    /// it.
    ///
    /// Lookup and insert share one IMMEDIATE transaction; the UNIQUE pair
    /// constraint catches writers outside this process, and a conflict is
    /// resolved by reading the winner's row.
    pub fn create_thread_for_pair(&self, a: i64, b: i64) -> Result<(ThreadRow, bool)> {
        if a == b {
            return Err(anyhow!("A thread needs two distinct participants"));
        }
        let (low, high) = canonical_pair(a, b);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(existing) = query_thread_by_pair(&tx, low, high)? {
                return Ok((existing, false));
            }

            let now = format_timestamp(Utc::now());
            let inserted = tx.execute(
                "INSERT INTO threads (user_low, user_high, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                (low, high, &now),
            );
            if let Err(e) = inserted {
                let e = anyhow::Error::from(e);
                if is_constraint_violation(&e) {
                    debug!("Thread for pair ({}, {}) created concurrently, reading it back", low, high);
                    let existing = query_thread_by_pair(&tx, low, high)?
                        .ok_or_else(|| anyhow!("Thread pair conflict without a row: ({}, {})", low, high))?;
                    return Ok((existing, false));
                }
                return Err(e);
            }

            let thread_id = tx.last_insert_rowid();
            for user_id in [low, high] {
                tx.execute(
                    "INSERT INTO thread_participants (thread_id, user_id) VALUES (?1, ?2)",
                    (thread_id, user_id),
                )?;
            }
            tx.commit()?;

            Ok((
                ThreadRow {
                    id: thread_id,
                    created_at: now.clone(),
                    updated_at: now,
                },
                true,
            ))
        })
    }

    pub fn get_thread(&self, thread_id: i64) -> Result<Option<ThreadRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, created_at, updated_at FROM threads WHERE id = ?1",
                    [thread_id],
                    thread_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Threads `user_id` participates in, most recently active first.
    pub fn list_threads_for_user(&self, user_id: i64) -> Result<Vec<ThreadRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id, t.created_at, t.updated_at
                 FROM threads t
                 JOIN thread_participants p ON p.thread_id = t.id
                 WHERE p.user_id = ?1
                 ORDER BY t.updated_at DESC, t.id DESC",
            )?;
            let rows = stmt
                .query_map([user_id], thread_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn is_participant(&self, thread_id: i64, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM thread_participants WHERE thread_id = ?1 AND user_id = ?2",
                    (thread_id, user_id),
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Batch-fetch participants for a set of threads.
    pub fn get_participants(&self, thread_ids: &[i64]) -> Result<Vec<ParticipantRow>> {
        if thread_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=thread_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT p.thread_id, u.id, u.username, u.created_at, u.updated_at
                 FROM thread_participants p
                 JOIN users u ON p.user_id = u.id
                 WHERE p.thread_id IN ({})
                 ORDER BY p.thread_id, u.id",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(thread_ids), |row| {
                    Ok(ParticipantRow {
                        thread_id: row.get(0)?,
                        user_id: row.get(1)?,
                        username: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Moves a thread's last activity forward. Never moves it backwards, so
    /// out-of-order touches from concurrent senders are harmless.
    pub fn touch_thread(&self, thread_id: i64, at: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE threads SET updated_at = MAX(updated_at, ?2) WHERE id = ?1",
                (thread_id, at),
            )?;
            Ok(changed > 0)
        })
    }

    // -- Messages --

    /// Appends a message and advances the thread's last activity in the same
    /// transaction. Its `created_at` is clamped to the thread's newest
    /// message so (created_at, id) order within a thread always matches
    /// insertion order, even if the wall clock steps back.
    pub fn insert_message(&self, thread_id: i64, sender_id: i64, content: &str) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let newest: Option<String> = tx.query_row(
                "SELECT MAX(created_at) FROM messages WHERE thread_id = ?1",
                [thread_id],
                |row| row.get(0),
            )?;
            let now = format_timestamp(Utc::now());
            let created_at = match newest {
                Some(newest) if newest > now => newest,
                _ => now,
            };

            tx.execute(
                "INSERT INTO messages (thread_id, sender_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                (thread_id, sender_id, content, &created_at),
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE threads SET updated_at = MAX(updated_at, ?2) WHERE id = ?1",
                (thread_id, &created_at),
            )?;

            let row = tx.query_row(
                &format!("{MESSAGE_SELECT} WHERE m.id = ?1"),
                [id],
                message_from_row,
            )?;
            tx.commit()?;
            Ok(row)
        })
    }

    /// Full history of a thread, oldest first.
    pub fn get_messages(&self, thread_id: i64) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT} WHERE m.thread_id = ?1 ORDER BY m.created_at ASC, m.id ASC"
            ))?;
            let rows = stmt
                .query_map([thread_id], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// The newest message of every thread `user_id` participates in.
    pub fn latest_messages_for_user(&self, user_id: i64) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.thread_id IN (SELECT thread_id FROM thread_participants WHERE user_id = ?1)
                   AND m.id = (
                       SELECT l.id FROM messages l
                       WHERE l.thread_id = m.thread_id
                       ORDER BY l.created_at DESC, l.id DESC
                       LIMIT 1
                   )"
            ))?;
            let rows = stmt
                .query_map([user_id], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn latest_message(&self, thread_id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "{MESSAGE_SELECT} WHERE m.thread_id = ?1 ORDER BY m.created_at DESC, m.id DESC LIMIT 1"
                    ),
                    [thread_id],
                    message_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }
}

fn canonical_pair(a: i64, b: i64) -> (i64, i64) {
    if a < b { (a, b) } else { (b, a) }
}

fn query_user(conn: &Connection, column: &str, value: &dyn rusqlite::ToSql) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, username, password, created_at, updated_at FROM users WHERE {} = ?1",
        column
    ))?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_thread_by_pair(conn: &Connection, low: i64, high: i64) -> Result<Option<ThreadRow>> {
    let row = conn
        .query_row(
            "SELECT id, created_at, updated_at FROM threads WHERE user_low = ?1 AND user_high = ?2",
            (low, high),
            thread_from_row,
        )
        .optional()?;
    Ok(row)
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ThreadRow> {
    Ok(ThreadRow {
        id: row.get(0)?,
        created_at: row.get(1)?,
        updated_at: row.get(2)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row.get(3)?,
        sender_created_at: row.get(4)?,
        sender_updated_at: row.get(5)?,
        content: row.get(6)?,
        created_at: row.get(7)?,
    })
}
