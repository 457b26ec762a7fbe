mod config;
mod db;
mod frame;
mod presence;
mod routes;
mod services;
mod state;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let pool = db::init_pool(&database_url)
        .await
        .expect("database init failed");

    let coordination = config::CoordinationConfig::from_env();
    let state = state::AppState::new(pool, coordination);

    // Background workers: the reaper sweeps and the lobby count watcher.
    let _reapers = services::reaper::spawn_reaper_tasks(&state);
    let _lobby = services::lobby::spawn_lobby_watcher(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "partyroom listening");
    axum::serve(listener, app).await.expect("server failed");
}
