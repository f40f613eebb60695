pub mod app;
pub mod config;
pub mod endpoint;
pub mod logging;
pub mod relay;
pub mod telemetry;
pub mod tunnel;

pub async fn run(cfg: config::TunnelConfig) -> anyhow::Result<()> {
    app::run(cfg).await
}
