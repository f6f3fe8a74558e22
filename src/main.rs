use meterlink::{run_engine, EngineError, EngineSettings, LogSink};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = EngineSettings::from_env()?.normalize()?;
    log::info!(
        "starting meterlink with {:?} backend as {}",
        config.backend,
        config.user_identifier
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown requested");
            shutdown.cancel();
        }
    });

    run_engine(config, Arc::new(LogSink), cancel).await
}
