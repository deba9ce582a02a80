use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                username    TEXT NOT NULL UNIQUE,
                password    TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            -- user_low/user_high hold the participant pair in canonical order,
            -- so one UNIQUE constraint covers both directions.
            CREATE TABLE IF NOT EXISTS threads (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_low    INTEGER NOT NULL REFERENCES users(id),
                user_high   INTEGER NOT NULL REFERENCES users(id),
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                CHECK (user_low < user_high),
                UNIQUE (user_low, user_high)
            );

            CREATE INDEX IF NOT EXISTS idx_threads_updated
                ON threads(updated_at);

            CREATE TABLE IF NOT EXISTS thread_participants (
                thread_id   INTEGER NOT NULL REFERENCES threads(id),
                user_id     INTEGER NOT NULL REFERENCES users(id),
                PRIMARY KEY (thread_id, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_participants_user
                ON thread_participants(user_id);

            CREATE TABLE IF NOT EXISTS messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id   INTEGER NOT NULL REFERENCES threads(id),
                sender_id   INTEGER NOT NULL REFERENCES users(id),
                content     TEXT NOT NULL CHECK (length(trim(content)) > 0),
                created_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_thread
                ON messages(thread_id, created_at, id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
