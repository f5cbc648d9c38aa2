use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use voxline_rt::{AgentBuilder, server};

const BIND_VAR: &str = "VOXLINE_BIND";
const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> voxline_rt::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();

    let agent = AgentBuilder::from_env().build().inspect_err(|e| {
        tracing::error!("Invalid configuration: {e}");
    })?;
    let bind = std::env::var(BIND_VAR).unwrap_or_else(|_| DEFAULT_BIND.to_string());

    server::serve(Arc::new(agent), bind.as_str()).await
}
