//! Example: a minimal bot that logs dispatches and answers `!ping`
//!
//! Run with: BOT_TOKEN=... cargo run --example gateway

use serde_json::json;
use shardline::{
    ClientConfig, DispatchEvent, ErrorKind, GatewayHandler, RateLimitEvent, RestClient,
    ShardManager, ShardingConfig,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT
const INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 15);

struct PingBot {
    rest: Arc<RestClient>,
}

impl GatewayHandler for PingBot {
    async fn on_dispatch(&self, shard_id: u32, event: DispatchEvent) {
        if event.name != "MESSAGE_CREATE" || event.data["content"] != "!ping" {
            return;
        }

        let Some(channel_id) = event.data["channel_id"].as_str() else {
            return;
        };
        info!("[SHARD-{}] Ping in channel {}", shard_id, channel_id);

        let endpoint = format!("/channels/{}/messages", channel_id);
        if let Err(e) = self.rest.post(&endpoint, json!({"content": "Pong!"})).await {
            warn!("Failed to reply: {}", e);
        }
    }

    async fn on_shard_create(&self, shard_id: u32) {
        info!("[SHARD-{}] Created", shard_id);
    }

    async fn on_ready(&self) {
        info!("All shards ready");
    }

    async fn on_disconnect(&self) {
        info!("All shards disconnected");
    }

    async fn on_rate_limit(&self, event: RateLimitEvent) {
        info!("{} waiting {:?}", event.route, event.reset_after);
    }

    async fn on_error(&self, kind: ErrorKind, message: &str, shard_id: u32) -> bool {
        warn!("[SHARD-{}] {:?}: {}", shard_id, kind, message);
        true
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,shardline=debug")),
        )
        .init();

    let config = ClientConfig::builder()
        .token(std::env::var("BOT_TOKEN")?)
        .intents(INTENTS)
        .sharding(ShardingConfig {
            enabled: true,
            ..Default::default()
        })
        .build()?;
    info!("Config: {:?}", config);

    let rest = Arc::new(RestClient::new(config.token.clone(), config.rest.clone()));
    let manager = ShardManager::new(config, PingBot { rest });

    manager.connect().await?;
    info!("Spawned shards {:?}", manager.shard_ids());

    info!("Running... Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    // Print final metrics
    let snapshot = manager.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Resumes: {}", snapshot.resumes_total);
    info!("  Messages received: {}", snapshot.messages_received_total);
    info!("  Ready shards: {}", snapshot.ready_shards);
    if let Some(latency) = manager.latency() {
        info!("  Mean latency: {:?}", latency);
    }

    // Graceful shutdown
    manager.disconnect().await;
    info!("Manager stopped");

    Ok(())
}
