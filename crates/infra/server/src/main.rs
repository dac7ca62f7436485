//! HubSync server binary.

use std::path::Path;
use std::sync::Arc;

use hubsync_core::ProviderClient;
use hubsync_memory_adapter::MemoryAdapter;
use hubsync_server::{AppConfig, SyncApp};
use hubsync_vault::KeyRing;

#[cfg(feature = "http-client")]
use hubsync_server::StripeClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Optional TOML config file as the only argument.
    let config_path = std::env::args().nth(1);
    let config = AppConfig::load(config_path.as_deref().map(Path::new))?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    let ring = KeyRing::init_global(KeyRing::from_config(
        &config.encryption_key,
        &config.rotation_keys,
    )?);

    let storage = Arc::new(MemoryAdapter::new());

    #[cfg(feature = "http-client")]
    let providers: Vec<Arc<dyn ProviderClient>> = vec![Arc::new(StripeClient::new())];
    #[cfg(not(feature = "http-client"))]
    let providers: Vec<Arc<dyn ProviderClient>> = Vec::new();

    let app = SyncApp::build(config, storage, ring, providers);
    app.run().await?;

    Ok(())
}
