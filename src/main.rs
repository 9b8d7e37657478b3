use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use const_format::formatcp;
use polygate::{
    BANNER,
    config::POLYGATE_CONFIG,
    conductor::Conductor,
    error::PolygateError,
    executors::{claude::ClaudeExecutor, codex::CodexExecutor, gemini::GeminiExecutor},
    persistence::{BillingStore, DailyLimiter},
    router::RouterBuilder,
    services::{
        auth_actor::AuthPoolHandle, auth_manager::AuthManager, registry::ModelRegistry,
        usage_sink::UsageRecorder,
    },
    state::AppState,
};
use tracing_subscriber::fmt::time::ChronoLocal;

/// Async main function using tokio runtime
#[tokio::main]
async fn main() -> Result<(), PolygateError> {
    // parse command line arguments
    polygate::Args::parse();
    // set up logging time format
    let timer = ChronoLocal::new("%H:%M:%S%.3f".to_string());
    // set up logging
    tracing_subscriber::fmt().with_timer(timer).pretty().init();

    println!("{}", *BANNER);

    const TITLE: &str = formatcp!(
        "polygate v{} by {}",
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_AUTHORS")
    );
    println!("{}", TITLE.blue());
    let config = POLYGATE_CONFIG.load_full();
    println!("Listening on {}", config.address().to_string().green());
    println!("{}", config);

    // durable stores live beside the config file
    let limiter = Arc::new(DailyLimiter::new(&config.limits_db_path()).await?);
    let billing = Arc::new(BillingStore::new(&config.billing_db_path()).await?);

    // credential pool and executors
    let pool = AuthPoolHandle::start(config.credentials.to_owned())
        .await
        .map_err(|e| {
            use snafu::GenerateImplicitData;
            PolygateError::RactorError {
                loc: snafu::Location::generate(),
                msg: format!("Failed to start pool actor: {e}"),
            }
        })?;
    let manager = Arc::new(AuthManager::new(pool));
    manager.register_executor(Arc::new(ClaudeExecutor));
    manager.register_executor(Arc::new(CodexExecutor));
    manager.register_executor(Arc::new(GeminiExecutor));

    let registry = Arc::new(ModelRegistry::new());
    let conductor = Conductor::new(manager, registry);

    let usage = UsageRecorder::start(billing.to_owned());
    let state = AppState::new(conductor, billing, limiter, usage);

    // build axum router
    let router = RouterBuilder::new_default(state).build();
    let addr = config.address();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
