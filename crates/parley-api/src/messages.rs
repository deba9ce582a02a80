use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use parley_core::Identity;
use parley_types::api::SendMessageRequest;

use crate::auth::AppState;
use crate::error::ApiError;
use crate::threads::parse_thread_id;

pub async fn send_message(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let thread_id = parse_thread_id(&thread_id)?;
    let message = state
        .messenger
        .send_message(&identity, thread_id, &req.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Full history, oldest first. Also the fallback for clients that missed
/// real-time updates.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let thread_id = parse_thread_id(&thread_id)?;
    let messages = state.messenger.list_messages(&identity, thread_id).await?;
    Ok(Json(messages))
}
