use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};

use parley_core::{ChatError, Identity};
use parley_types::api::CreateThreadRequest;
use parley_types::models::ThreadId;

use crate::auth::AppState;
use crate::error::ApiError;

pub async fn list_threads(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let threads = state.messenger.list_threads(&identity).await?;
    Ok(Json(threads))
}

/// Returns the existing thread for the pair when there is one.
pub async fn create_thread(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateThreadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let thread = state
        .messenger
        .create_thread(&identity, &req.participant_username)
        .await?;
    Ok(Json(thread))
}

pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let thread_id = parse_thread_id(&thread_id)?;
    let thread = state.messenger.get_thread(&identity, thread_id).await?;
    Ok(Json(thread))
}

/// Thread ids arrive as path text; anything that is not a positive integer
/// is bad input rather than a routing miss.
pub(crate) fn parse_thread_id(raw: &str) -> Result<ThreadId, ChatError> {
    match raw.parse::<ThreadId>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ChatError::bad_input(format!("Invalid thread id '{}'", raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_must_be_positive_integers() {
        assert_eq!(parse_thread_id("12").unwrap(), 12);
        for raw in ["0", "-3", "abc", "1.5", ""] {
            assert!(matches!(parse_thread_id(raw), Err(ChatError::BadInput(_))), "{raw}");
        }
    }
}
