//! Meridian server binary.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use meridian_server::{Server, ServerOptions};

#[tokio::main]
async fn main() {
    let opts = ServerOptions::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(opts.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %opts.host,
        port = opts.port,
        dir = %opts.dir.display(),
        dev = opts.dev,
        "starting meridian"
    );

    let server = match Server::new(opts) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };
    if let Err(e) = server.run().await {
        tracing::error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
