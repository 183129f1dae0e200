use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    let app = nestegg::api::App::parse();
    init_tracing(&app.log_level);

    if let Err(e) = nestegg::api::run(app).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
