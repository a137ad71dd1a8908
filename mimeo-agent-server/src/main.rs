mod api;
mod types;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, Level};

use mimeo::{DesktopDriver, ScreenDriver, SessionRegistry, TraceStore};

#[derive(Parser, Debug)]
#[command(name = "mimeo-agent-server")]
#[command(about = "HTTP control plane for trace-grounded desktop task replay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "7888")]
    port: u16,

    /// Directory holding recorded traces
    #[arg(long, default_value = "./trace_data")]
    trace_dir: String,

    /// Default grounding service endpoint
    #[arg(long, default_value = "http://127.0.0.1:7887/generate_action")]
    server_url: String,

    /// Default screen index for capture and input
    #[arg(long, default_value = "0")]
    selected_screen: u32,

    /// Default step budget per task
    #[arg(long, default_value = "50")]
    max_steps: u32,

    /// Enable CORS for all origins
    #[arg(long)]
    cors: bool,
}

/// Shared state behind the router: the single-slot registry, the trace
/// store, the desktop driver, and per-process defaults.
pub struct AppState {
    pub registry: SessionRegistry,
    pub trace_store: TraceStore,
    pub driver: Arc<dyn ScreenDriver>,
    pub server_url: String,
    pub selected_screen: u32,
    pub max_steps: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("🚀 Starting mimeo-agent-server v{}", env!("CARGO_PKG_VERSION"));
    info!("🔧 Port: {}", args.port);
    info!("🔧 Trace dir: {}", args.trace_dir);
    info!("🔧 Grounding endpoint: {}", args.server_url);
    info!("🔧 CORS: {}", if args.cors { "enabled" } else { "disabled" });

    let state = Arc::new(AppState {
        registry: SessionRegistry::new(),
        trace_store: TraceStore::new(&args.trace_dir),
        driver: Arc::new(DesktopDriver::new()),
        server_url: args.server_url,
        selected_screen: args.selected_screen,
        max_steps: args.max_steps,
    });

    // Build router
    let mut app = Router::new()
        // Health check
        .route("/health", get(api::health))
        // Task lifecycle
        .route("/run_task", post(api::run_task))
        .route("/stop", post(api::stop))
        .route("/status", get(api::status))
        // Shared state
        .with_state(state);

    // Add CORS if enabled
    if args.cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    // Start server
    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("✅ Server listening on http://{}", addr);
    info!("🎯 Ready to replay taught workflows!");

    axum::serve(listener, app).await?;

    Ok(())
}
