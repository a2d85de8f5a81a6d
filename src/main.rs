use axum::response::Html;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use book_rag::api;
use book_rag::config::Config;
use book_rag::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    config.validate()?;
    tracing::info!("Book: {}", config.book_path().display());
    tracing::info!("Embedding cache: {}", config.cache_path().display());
    tracing::info!("LLM provider: {} ({})", config.llm.provider, config.llm.base_url);
    tracing::info!(
        "Embedding provider: {} ({}, model {})",
        config.embedding.provider,
        config.embedding.base_url,
        config.embedding.model
    );

    // Indexes and embeddings are ready before the listener binds.
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config).await?;

    let app = Router::new()
        // Serve frontend
        .route("/", get(serve_index))
        // API routes
        .route("/health", get(api::search::health))
        .route("/api/search", post(api::search::search))
        .route("/api/ask-agent", post(api::ask::ask_agent))
        .route("/api/ask-agent/stream", post(api::ask::ask_agent_stream))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn serve_index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}
