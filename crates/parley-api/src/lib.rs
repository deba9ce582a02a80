//! REST surface of the messaging service.

pub mod auth;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod threads;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use auth::AppState;

/// Routes for accounts, threads and messages. Every route past the auth
/// endpoints runs behind [`middleware::resolve_identity`].
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/me", get(auth::me))
        .route("/threads", get(threads::list_threads).post(threads::create_thread))
        .route("/threads/{thread_id}", get(threads::get_thread))
        .route(
            "/threads/{thread_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::resolve_identity,
        ))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}
