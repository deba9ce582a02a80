mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::auth::{AppState, AppStateInner};
use parley_core::{Dispatcher, Messenger, TokenIssuer};
use parley_db::Database;
use parley_gateway::connection;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_server=debug,parley_api=debug,parley_core=debug,parley_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Database::open(&config.db_path)?;

    // Shared state
    let messenger = Arc::new(Messenger::new(
        Arc::new(db),
        TokenIssuer::new(&config.jwt_secret, chrono::Duration::days(config.token_ttl_days)),
        Dispatcher::with_buffer(config.subscriber_buffer),
    ));
    let app_state: AppState = Arc::new(AppStateInner {
        messenger: messenger.clone(),
    });

    if !config.seed_users.is_empty() {
        parley_api::auth::seed_users(&app_state, &config.seed_users, &config.seed_password).await?;
    }

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(messenger);

    let app = parley_api::router(app_state)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.addr().parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(
    State(messenger): State<Arc<Messenger<Database>>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, messenger))
}
