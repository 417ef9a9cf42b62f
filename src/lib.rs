//! # shardline
//!
//! A sharded gateway client with session resume, heartbeating and a
//! rate-limit aware REST client.
//!
//! ## Features
//!
//! - **Sharding** with identify batching by `max_concurrency`
//! - **Session resume** across reconnects, with close-code driven recovery
//! - **Heartbeating** with jitter, latency tracking and zombie detection
//! - **Send window** keeping outbound frames under the gateway limit
//! - **REST buckets** per route with in-place `429` retry
//! - **zlib-stream** transport compression (`zlib` feature, on by default)
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use shardline::{ClientConfig, DispatchEvent, GatewayHandler, ShardManager};
//!
//! struct Bot;
//!
//! impl GatewayHandler for Bot {
//!     async fn on_dispatch(&self, shard_id: u32, event: DispatchEvent) {
//!         println!("[{}] {}", shard_id, event.name);
//!     }
//! }
//!
//! let config = ClientConfig::builder()
//!     .token(std::env::var("BOT_TOKEN")?)
//!     .intents(513)
//!     .build()?;
//!
//! let manager = ShardManager::new(config, Bot);
//! manager.connect().await?;
//! ```

mod bucket;
mod config;
mod connection;
mod error;
mod handler;
mod heartbeat;
mod inflate;
mod manager;
mod metrics;
mod protocol;
mod queue;
mod rest;
mod shard;
mod transport;

#[cfg(test)]
mod test_support;

pub use bucket::{normalize_route, route_key, Bucket, BucketState, RequestEntry};
pub use config::{
    mask_token, BackoffConfig, ClientConfig, ClientConfigBuilder, ConfigError, ConnectionConfig,
    GatewayConfig, RestConfig, ShardCount, ShardingConfig, IDENTIFY_SPACING,
};
pub use error::{Error, ErrorKind};
pub use handler::GatewayHandler;
pub use inflate::{Inflater, COMPRESSION_AVAILABLE};
pub use manager::{shard_id_for_guild, ClientState, ResolvedSharding, ShardManager};
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use protocol::{
    CloseCode, CloseDisposition, DispatchEvent, GatewayBot, GatewayPayload, Hello, Identify,
    IdentifyProperties, OpCode, Ready, Resume, SessionStartLimit, NORMAL_CLOSE_CODE,
    RESUMABLE_CLOSE_CODE,
};
pub use queue::{Entry, Queue};
pub use rest::{RateLimitEvent, RestClient};
pub use shard::{DisconnectMode, Shard, ShardEvent, ShardState};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};

// Re-export http types used by the REST seam
pub use http::{HeaderMap, Method, StatusCode};

/// Result type for shardline operations
pub type Result<T> = std::result::Result<T, Error>;
