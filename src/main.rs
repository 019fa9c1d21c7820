use anyhow::Result;
use gaxy::{Application, Settings};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    init_tracing(&settings);

    info!(
        port = settings.port,
        origin = %settings.google_origin,
        route_prefix = %settings.route_prefix,
        cache_enabled = settings.cache_enabled,
        rate_limit_enabled = settings.rate_limit_enabled,
        "starting gaxy"
    );

    let app = Application::new(settings)?;
    app.run().await?;

    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if settings.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
