use clap::Parser;
use coedit_server::{ServerConfig, ServerState, server};
use std::{net::SocketAddr, path::PathBuf};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Args {
    #[clap(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:3030")]
    host: SocketAddr,
    #[clap(short, long, env = "STORAGE", default_value = "storage")]
    storage: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = ServerConfig::from_env().expect("Loading server config");
    let state = ServerState::new(config, args.storage)
        .await
        .expect("Init server state");

    info!("Starting server on http://{}", args.host);

    let listener = tokio::net::TcpListener::bind(args.host)
        .await
        .expect("Unable to bind to host");
    axum::serve(
        listener,
        server(state.clone()).layer(TraceLayer::new_for_http()),
    )
    .with_graceful_shutdown(async { tokio::signal::ctrl_c().await.expect("Listen to ctrlc") })
    .await
    .unwrap();

    info!("Server has shut down, persisting open documents");
    state.persist().await;
}
