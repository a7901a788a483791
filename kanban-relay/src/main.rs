use std::sync::Arc;

use kanban_collab::server::{AllowAll, Authorizer, RelayServer, ServerConfig, StaticTokenAuthorizer};
use log::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;

    let authorizer: Arc<dyn Authorizer> = match std::env::var("KANBAN_RELAY_TOKENS") {
        Ok(spec) => {
            let tokens = StaticTokenAuthorizer::parse(&spec)?;
            info!("Loaded {} board access tokens", tokens.len());
            Arc::new(tokens)
        }
        Err(_) => {
            warn!("KANBAN_RELAY_TOKENS not set, every join will be accepted");
            Arc::new(AllowAll)
        }
    };

    info!(
        "Starting kanban relay on {} (max {} viewers per board)",
        config.bind_addr, config.max_peers_per_room
    );

    let server = RelayServer::with_authorizer(config, authorizer);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} messages relayed",
                stats.total_connections, stats.total_messages
            );
        }
    }
    Ok(())
}
