use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};

use crate::auth::AppState;
use crate::error::ApiError;

/// Resolve the bearer token (if any) into an `Identity` request extension.
///
/// A missing or invalid token is not rejected here: the request proceeds as
/// anonymous and each operation decides whether that is enough.
pub async fn resolve_identity(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string());

    let identity = state.messenger.identify(bearer.as_deref()).await?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
