use crate::error::ErrorKind;
use crate::protocol::{DispatchEvent, GatewayPayload};
use crate::rest::RateLimitEvent;
use std::future::Future;

/// Trait that users implement to receive gateway events.
///
/// This trait defines the contract between the shard manager and user code.
/// The manager handles connection lifecycle, session resume, heartbeating and
/// rate limits, while the handler consumes dispatches and lifecycle signals.
/// Calls for one shard arrive in order; calls for different shards may
/// interleave.
///
/// # Example
///
/// ```ignore
/// use shardline::{DispatchEvent, GatewayHandler};
///
/// struct Bot;
///
/// impl GatewayHandler for Bot {
///     async fn on_dispatch(&self, shard_id: u32, event: DispatchEvent) {
///         if event.name == "MESSAGE_CREATE" {
///             println!("[{}] {}", shard_id, event.data["content"]);
///         }
///     }
///
///     async fn on_ready(&self) {
///         println!("all shards ready");
///     }
/// }
/// ```
pub trait GatewayHandler: Send + Sync + 'static {
    /// Called for every dispatch event, undecoded.
    fn on_dispatch(&self, shard_id: u32, event: DispatchEvent)
        -> impl Future<Output = ()> + Send;

    /// Called with lifecycle diagnostics. `None` means the message came from
    /// the manager rather than a shard.
    fn on_debug(&self, _shard_id: Option<u32>, _message: &str) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called for every inbound payload before it is interpreted.
    fn on_raw(&self, _shard_id: u32, _payload: &GatewayPayload) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called when a shard has been created, before it connects.
    fn on_shard_create(&self, _shard_id: u32) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called once each time every shard becomes ready.
    fn on_ready(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called once each time every shard becomes disconnected.
    fn on_disconnect(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called when a REST request waits for its bucket to reset.
    fn on_rate_limit(&self, _event: RateLimitEvent) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called when a shard reports an error.
    ///
    /// For connect failures the return value decides whether the shard is
    /// retried after a backoff delay. Fatal errors are never retried.
    fn on_error(
        &self,
        _kind: ErrorKind,
        _message: &str,
        _shard_id: u32,
    ) -> impl Future<Output = bool> + Send {
        async { true }
    }
}
