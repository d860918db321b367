//! Command center status board

use command_center::{
    api::ApiClient,
    config::{AppConfig, ViewConfig},
    errors::CommandCenterError,
    ingestor::{IngestorHandle, IngestorSettings, StreamIngestor},
    models::district_name,
    mqtt::MqttClientBuilder,
    view::{DistrictFilter, ViewFilter},
};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), CommandCenterError> {
    // A missing .env file is fine, the environment may be set already
    #[cfg(feature = "dotenvy")]
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load configuration, preferring environment variables over config files
    let config = AppConfig::load()?;
    config.validate()?;

    let api = ApiClient::new(&config.api)?;

    let mqtt_client = MqttClientBuilder::new(&config.mqtt, config.api.auth_token.as_deref())?
        .connect(&config.mqtt.topics)
        .await?;

    let ingestor = StreamIngestor::new(IngestorSettings::try_from(&config)?, api.clone(), api)
        .spawn(mqtt_client);

    tokio::select! {
        result = report_changes(&ingestor, &config.view) => {
            info!("Status reporting completed: {:?}", result);
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    ingestor.shutdown().await
}

/// Log a one-line summary of the filtered board whenever it changes
async fn report_changes(
    ingestor: &IngestorHandle,
    view: &ViewConfig,
) -> Result<(), CommandCenterError> {
    let filter = ViewFilter::new(&view.search, &view.district);
    if let DistrictFilter::Code(code) = filter.district() {
        match district_name(code) {
            Some(name) => info!("Reporting stations in district {} ({})", code, name),
            None => warn!("Unknown district code {}", code),
        }
    }

    let mut changes = ingestor.subscribe();
    while changes.changed().await.is_ok() {
        let view = ingestor.view(filter.clone()).await?;
        if let Some(e) = &view.last_error {
            error!("Ingestor reported an error: {}", e);
        }
        info!(
            "connected={} shown={} total={} online={} inside={} outside={} offline={}",
            view.connected,
            view.records.len(),
            view.stats.total,
            view.stats.online,
            view.stats.inside,
            view.stats.outside,
            view.stats.offline,
        );
    }

    Ok(())
}
