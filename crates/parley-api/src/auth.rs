use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::{error, info};

use parley_core::{ChatError, Identity, Messenger, Store};
use parley_db::{Database, is_constraint_violation};
use parley_types::api::{AuthResponse, LoginRequest, RegisterRequest};
use parley_types::models::User;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub messenger: Arc<Messenger<Database>>,
}

impl AppStateInner {
    fn db(&self) -> &Arc<Database> {
        self.messenger.store()
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Validate input
    let username = req.username.trim().to_string();
    let length = username.chars().count();
    if !(3..=32).contains(&length) {
        return Err(ChatError::bad_input("Username must be 3-32 characters").into());
    }
    if username.chars().any(char::is_whitespace) {
        return Err(ChatError::bad_input("Username cannot contain whitespace").into());
    }
    if req.password.len() < 8 {
        return Err(ChatError::bad_input("Password must be at least 8 characters").into());
    }

    let db = state.db().clone();
    let user = run_blocking(move || create_account(&db, &username, &req.password)).await??;
    info!("Registered {} ({})", user.username, user.id);

    let token = state.messenger.tokens().issue(&user).map_err(ApiError::Internal)?;
    Ok((StatusCode::CREATED, Json(AuthResponse { token, user })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db().clone();
    let user = run_blocking(move || {
        let row = db
            .get_user_by_username(&req.username)
            .map_err(|e| ApiError::Chat(ChatError::Unavailable(e)))?
            .ok_or(ApiError::InvalidCredentials)?;

        // Verify password
        let parsed_hash = PasswordHash::new(&row.password)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("stored hash unreadable: {}", e)))?;
        Argon2::default()
            .verify_password(req.password.as_bytes(), &parsed_hash)
            .map_err(|_| ApiError::InvalidCredentials)?;

        db.find_user_by_id(row.id)
            .map_err(ChatError::from)?
            .ok_or(ApiError::InvalidCredentials)
    })
    .await??;

    let token = state.messenger.tokens().issue(&user).map_err(ApiError::Internal)?;
    Ok(Json(AuthResponse { token, user }))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = identity.user()?.id;
    let db = state.db().clone();
    let user = run_blocking(move || {
        db.find_user_by_id(user_id)
            .map_err(ChatError::from)?
            .ok_or(ApiError::Chat(ChatError::Unauthenticated))
    })
    .await??;
    Ok(Json(user))
}

/// Creates the given accounts with a shared password, skipping names that
/// already exist.
pub async fn seed_users(state: &AppState, usernames: &[String], password: &str) -> anyhow::Result<()> {
    for username in usernames {
        let db = state.db().clone();
        let name = username.clone();
        let password = password.to_string();
        let created = run_blocking(move || create_account(&db, &name, &password))
            .await
            .map_err(|e| anyhow::anyhow!("seeding {} failed: {:?}", username, e))?;
        match created {
            Ok(user) => info!("Seeded user {} ({})", user.username, user.id),
            Err(ApiError::Chat(ChatError::Conflict(_))) => info!("User {} already exists", username),
            Err(e) => return Err(anyhow::anyhow!("seeding {} failed: {:?}", username, e)),
        }
    }
    Ok(())
}

fn create_account(db: &Database, username: &str, password: &str) -> Result<User, ApiError> {
    // Check if username is taken
    if db
        .get_user_by_username(username)
        .map_err(|e| ApiError::Chat(ChatError::Unavailable(e)))?
        .is_some()
    {
        return Err(ChatError::Conflict("Username is already taken".into()).into());
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("password hashing failed: {}", e)))?
        .to_string();

    let row = db.create_user(username, &password_hash).map_err(|e| {
        if is_constraint_violation(&e) {
            ApiError::Chat(ChatError::Conflict("Username is already taken".into()))
        } else {
            ApiError::Chat(ChatError::Unavailable(e))
        }
    })?;

    db.find_user_by_id(row.id)
        .map_err(ChatError::from)?
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("user {} vanished after insert", row.id)))
}

/// Runs blocking DB and hashing work off the async runtime.
async fn run_blocking<F, T>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(anyhow::anyhow!("blocking task failed: {}", e))
    })
}
