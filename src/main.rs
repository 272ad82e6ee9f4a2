use anyhow::Result;
use clap::Parser;
use tracing::info;

use net_dfs::api::RegistrationStub;
use net_dfs::config::{AppConfig, CliArgs, Role};
use net_dfs::naming::NamingServer;
use net_dfs::storage::StorageServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let config = AppConfig::from_args(&args)?;

    match config.role {
        Role::Naming(naming) => {
            let server = NamingServer::new(&naming);
            server.start().await?;
            info!(
                service = %naming.service_addr,
                registration = %naming.registration_addr,
                threshold = naming.replication_threshold,
                "Naming server running, Ctrl-C to stop"
            );

            tokio::signal::ctrl_c().await?;
            server.stop().await;
        }
        Role::Storage {
            storage,
            registration_addr,
        } => {
            let server = StorageServer::new(&storage);
            let naming = RegistrationStub::new(registration_addr);
            server.start(&naming).await?;
            info!(
                root = ?storage.root,
                naming = %registration_addr,
                "Storage server running, Ctrl-C to stop"
            );

            tokio::signal::ctrl_c().await?;
            server.stop().await;
        }
    }

    info!("Stopped. Goodbye.");
    Ok(())
}
