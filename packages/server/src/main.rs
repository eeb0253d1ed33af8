use tracing_subscriber::EnvFilter;

mod init;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let services = init::init_from_env().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, waiting for running jobs");

    services.legacy.pause()?;
    services.scheduler.shutdown(true).await?;
    services.legacy.shutdown()?;

    tracing::info!("Scheduler stopped");
    Ok(())
}
