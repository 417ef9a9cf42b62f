use std::fmt;
use std::time::Duration;

/// Minimum spacing between two identifies on the same shard
pub const IDENTIFY_SPACING: Duration = Duration::from_millis(5_500);

/// Configuration for a gateway client
#[derive(Clone)]
pub struct ClientConfig {
    /// Bot token, sent on identify and as REST authorization
    pub token: String,
    /// Gateway intents bitmask
    pub intents: u64,
    /// Gateway protocol settings
    pub gateway: GatewayConfig,
    /// Sharding policy
    pub sharding: ShardingConfig,
    /// Per-connection settings
    pub connection: ConnectionConfig,
    /// Backoff settings for retrying failed connects
    pub backoff: BackoffConfig,
    /// REST client settings
    pub rest: RestConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: 0,
            gateway: GatewayConfig::default(),
            sharding: ShardingConfig::default(),
            connection: ConnectionConfig::default(),
            backoff: BackoffConfig::default(),
            rest: RestConfig::default(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("token", &mask_token(&self.token))
            .field("intents", &self.intents)
            .field("gateway", &self.gateway)
            .field("sharding", &self.sharding)
            .field("connection", &self.connection)
            .field("backoff", &self.backoff)
            .field("rest", &self.rest)
            .finish()
    }
}

impl ClientConfig {
    /// Create a new builder for configuration
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for ClientConfig
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the bot token
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    /// Set the gateway intents
    pub fn intents(mut self, intents: u64) -> Self {
        self.config.intents = intents;
        self
    }

    /// Set gateway configuration
    pub fn gateway(mut self, config: GatewayConfig) -> Self {
        self.config.gateway = config;
        self
    }

    /// Set sharding configuration
    pub fn sharding(mut self, config: ShardingConfig) -> Self {
        self.config.sharding = config;
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Set REST configuration
    pub fn rest(mut self, config: RestConfig) -> Self {
        self.config.rest = config;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let config = self.config;

        if config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        if config.backoff.max_delay < config.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if config.backoff.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        if config.connection.send_limit == 0 {
            return Err(ConfigError::InvalidConnection(
                "send_limit cannot be 0".to_string(),
            ));
        }

        if config.connection.send_window.is_zero() {
            return Err(ConfigError::InvalidConnection(
                "send_window cannot be zero".to_string(),
            ));
        }

        if config.connection.event_buffer == 0 {
            return Err(ConfigError::InvalidConnection(
                "event_buffer cannot be 0".to_string(),
            ));
        }

        if let ShardCount::Fixed(0) = config.sharding.max_shards {
            return Err(ConfigError::InvalidSharding(
                "max_shards cannot be 0".to_string(),
            ));
        }

        if let ShardCount::Fixed(0) = config.sharding.max_concurrency {
            return Err(ConfigError::InvalidSharding(
                "max_concurrency cannot be 0".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// No token was provided
    #[error("A bot token is required")]
    MissingToken,
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid connection configuration
    #[error("Invalid connection configuration: {0}")]
    InvalidConnection(String),
    /// Invalid sharding configuration
    #[error("Invalid sharding configuration: {0}")]
    InvalidSharding(String),
}

/// Gateway protocol settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway URL override; the bootstrap URL is used when unset
    pub url: Option<String>,
    /// Gateway API version
    pub version: u8,
    /// Request zlib-stream transport compression (ignored when the
    /// `zlib` feature is disabled)
    pub compress: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            version: 10,
            compress: false,
        }
    }
}

/// A shard count that is either fixed or taken from the gateway bootstrap call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardCount {
    /// Use the value recommended by the gateway
    #[default]
    Auto,
    /// Use exactly this value
    Fixed(u32),
}

impl ShardCount {
    /// Resolve against the gateway's recommendation
    pub fn resolve(self, recommended: u32) -> u32 {
        match self {
            ShardCount::Auto => recommended,
            ShardCount::Fixed(value) => value,
        }
    }
}

/// Sharding policy
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// When disabled the client runs a single unsharded session
    pub enabled: bool,
    /// Total number of shards
    pub max_shards: ShardCount,
    /// Shards allowed to identify concurrently
    pub max_concurrency: ShardCount,
    /// Delay between spawn batches
    pub spawn_delay: Duration,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_shards: ShardCount::Auto,
            max_concurrency: ShardCount::Auto,
            spawn_delay: IDENTIFY_SPACING,
        }
    }
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allowed from opening the socket to reaching Ready
    pub connect_timeout: Duration,
    /// Minimum spacing between identifies on one shard
    pub identify_spacing: Duration,
    /// Frames allowed per send window
    pub send_limit: u32,
    /// Length of the send window
    pub send_window: Duration,
    /// Capacity of each shard's event channel
    pub event_buffer: usize,
    /// Maximum number of connect attempts before giving up on a shard
    pub max_connect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            identify_spacing: IDENTIFY_SPACING,
            send_limit: 110,
            send_window: Duration::from_secs(60),
            event_buffer: 1024,
            max_connect_attempts: 10,
        }
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true, // Full jitter
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}

/// REST client configuration
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// API base URL, without a trailing slash
    pub base_url: String,
    /// User-Agent header value
    pub user_agent: String,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "https://discord.com/api/v10".to_string(),
            user_agent: format!(
                "DiscordBot ({}, {})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ),
        }
    }
}

/// Replace everything after the token's last `.` with `*`
pub fn mask_token(token: &str) -> String {
    let keep = token.rfind('.').map_or(0, |index| index + 1);
    let hidden = token[keep..].chars().count();
    format!("{}{}", &token[..keep], "*".repeat(hidden))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_calculation() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));

        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_with_jitter() {
        let config = BackoffConfig::default();
        for attempt in 0..5 {
            let delay = config.delay_for_attempt(attempt);
            let max_expected =
                Duration::from_millis((1000.0 * 2.0_f64.powi(attempt as i32)) as u64);
            assert!(delay <= max_expected);
        }
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::builder()
            .token("abc.def.ghi")
            .intents(513)
            .sharding(ShardingConfig {
                enabled: true,
                max_shards: ShardCount::Fixed(4),
                ..Default::default()
            })
            .build()
            .expect("valid config");

        assert_eq!(config.intents, 513);
        assert_eq!(config.sharding.max_shards, ShardCount::Fixed(4));
        assert_eq!(config.sharding.max_concurrency, ShardCount::Auto);
        assert_eq!(config.connection.send_limit, 110);
        assert_eq!(config.gateway.version, 10);
    }

    #[test]
    fn test_config_builder_rejects_missing_token() {
        let result = ClientConfig::builder().intents(1).build();
        assert!(matches!(result, Err(ConfigError::MissingToken)));
    }

    #[test]
    fn test_config_builder_rejects_zero_limits() {
        let result = ClientConfig::builder()
            .token("t")
            .connection(ConnectionConfig {
                send_limit: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidConnection(_))));

        let result = ClientConfig::builder()
            .token("t")
            .sharding(ShardingConfig {
                max_shards: ShardCount::Fixed(0),
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidSharding(_))));
    }

    #[test]
    fn test_shard_count_resolve() {
        assert_eq!(ShardCount::Auto.resolve(7), 7);
        assert_eq!(ShardCount::Fixed(2).resolve(7), 2);
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("abc.def.ghij"), "abc.def.****");
        assert_eq!(mask_token("nodots"), "******");
        assert_eq!(mask_token("trailing."), "trailing.");
    }

    #[test]
    fn test_debug_masks_token() {
        let config = ClientConfig::builder()
            .token("abc.def.secret")
            .build()
            .unwrap();
        let debug = format!("{config:?}");
        assert!(debug.contains("abc.def.******"));
        assert!(!debug.contains("secret"));
    }
}
