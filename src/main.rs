use config::CONFIG;
use controller::create_router;
use service::app_state::create_app_state;
use tokio_util::sync::CancellationToken;

use cyder_tools::log::{error, info, LocalLogger};

mod config;
mod controller;
mod database;
mod schema;
mod service;
mod utils;

#[tokio::main]
async fn main() {
    LocalLogger::init(&CONFIG.log_level);

    let app_state = match create_app_state(&CONFIG) {
        Ok(state) => state,
        Err(e) => {
            error!("failed to initialise gateway: {}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let sweeper = app_state
        .quota
        .spawn_sweeper(CONFIG.quota.sweep_interval(), cancel.clone());

    let addr = format!("{}:{}", &CONFIG.host, CONFIG.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", &addr, e);
            std::process::exit(1);
        }
    };
    info!("server start at {}{}", &addr, &CONFIG.base_path);

    let app = create_router(app_state.clone(), &CONFIG.base_path);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {}", e);
    }

    cancel.cancel();
    if let Err(e) = sweeper.await {
        error!("reservation sweeper panicked: {}", e);
    }
    app_state.recorder.flush().await;
    info!("server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received, draining connections");
}
