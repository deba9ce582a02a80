/// Database row types. These map directly to SQLite rows and stay distinct
/// from the parley-types API models to keep the DB layer independent.

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub password: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct ThreadRow {
    pub id: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// A participant link joined with the user it points at.
#[derive(Debug, Clone)]
pub struct ParticipantRow {
    pub thread_id: i64,
    pub user_id: i64,
    pub username: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A message joined with its sender.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub thread_id: i64,
    pub sender_id: i64,
    pub sender_username: String,
    pub sender_created_at: String,
    pub sender_updated_at: String,
    pub content: String,
    pub created_at: String,
}
