use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::auth::{self, AppState, AppStateInner};
use parley_api::history;
use parley_api::middleware::require_auth;
use parley_db::Database;
use parley_gateway::connection;
use parley_gateway::dispatcher::Dispatcher;

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into());
    let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLEY_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let dispatcher = Dispatcher::new();
    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        jwt_secret: jwt_secret.clone(),
    });

    let state = ServerState {
        dispatcher,
        db,
        jwt_secret,
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/users", get(history::list_users))
        .route("/messages/direct/{user_id}", get(history::get_direct_history))
        .route("/groups", get(history::get_my_groups))
        .route("/groups/{group_id}", get(history::get_group))
        .route("/groups/{group_id}/messages", get(history::get_group_messages))
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state.clone());

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.db, state.jwt_secret)
    })
}
