use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
  dotenvy::dotenv().ok();
  fmt().with_env_filter(EnvFilter::from_default_env()).init();

  if let Err(e) = rejuvenate_lib::run().await {
    tracing::error!("{}", e);
    std::process::exit(1);
  }
}
