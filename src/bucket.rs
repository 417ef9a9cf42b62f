//! Per-route REST rate-limit state

use crate::queue::Queue;
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::{Duration, Instant};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";

/// A request waiting in a bucket's queue
#[derive(Debug, Clone)]
pub struct RequestEntry {
    pub method: Method,
    pub endpoint: String,
    pub body: Option<Value>,
}

/// Rate-limit window as last observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketState {
    /// Requests allowed per window, unknown until a response is seen
    pub limit: Option<u32>,
    /// Requests left in the current window, unknown until seeded
    pub remaining: Option<u32>,
    /// When the current window resets
    pub reset_at: Option<Instant>,
}

/// Rate-limit state and request queue for one route
#[derive(Debug)]
pub struct Bucket {
    route: String,
    state: Mutex<BucketState>,
    queue: Queue<RequestEntry>,
}

impl Bucket {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            state: Mutex::new(BucketState::default()),
            queue: Queue::new(),
        }
    }

    /// Route key this bucket serves
    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn queue(&self) -> &Queue<RequestEntry> {
        &self.queue
    }

    pub fn state(&self) -> BucketState {
        *self.state.lock()
    }

    pub fn limit(&self) -> Option<u32> {
        self.state.lock().limit
    }

    pub fn remaining(&self) -> Option<u32> {
        self.state.lock().remaining
    }

    /// Time left until the window resets, if the window is exhausted
    pub fn reset_after(&self, now: Instant) -> Option<Duration> {
        let state = self.state.lock();
        match (state.remaining, state.reset_at) {
            (Some(0), Some(reset_at)) if reset_at > now => Some(reset_at - now),
            _ => None,
        }
    }

    /// Apply the rate-limit headers of a response received at `now`.
    ///
    /// `limit` and the reset instant always follow the headers. `remaining`
    /// is seeded from the header only while unknown and decremented locally
    /// afterwards; a window whose reset has passed becomes unknown again.
    pub fn update(&self, headers: &HeaderMap, now: Instant) {
        let limit = header_value::<u32>(headers, HEADER_LIMIT);
        let remaining = header_value::<u32>(headers, HEADER_REMAINING);
        let reset_after = header_value::<f64>(headers, HEADER_RESET_AFTER)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());

        let mut state = self.state.lock();
        if state.reset_at.is_some_and(|reset_at| reset_at <= now) {
            state.remaining = None;
        }

        state.remaining = match state.remaining {
            None => remaining,
            Some(current) => Some(current.saturating_sub(1)),
        };

        if let Some(limit) = limit {
            state.limit = Some(limit);
        }
        if let Some(reset_after) = reset_after {
            state.reset_at = Some(now + reset_after);
        }
    }

    /// Force the window empty until `now + retry_after`
    pub fn mark_exhausted(&self, retry_after: Duration, now: Instant) {
        let mut state = self.state.lock();
        state.remaining = Some(0);
        let until = now + retry_after;
        state.reset_at = Some(state.reset_at.map_or(until, |reset_at| reset_at.max(until)));
    }
}

fn header_value<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn is_snowflake(segment: &str) -> bool {
    (17..=19).contains(&segment.len()) && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Collapse an endpoint into the path shape shared by its rate limit.
///
/// Snowflakes become `:id`, everything after `reactions` becomes `:emoji`,
/// and the token after `webhooks/:id` becomes `:token`. Query strings are
/// dropped.
pub fn normalize_route(endpoint: &str) -> String {
    let path = endpoint
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    let segments: Vec<&str> = path.split('/').collect();

    let mut normalized: Vec<&str> = Vec::with_capacity(segments.len());
    let mut index = 0;
    while index < segments.len() {
        let segment = segments[index];
        normalized.push(if is_snowflake(segment) { ":id" } else { segment });

        if segment == "reactions" && index + 1 < segments.len() {
            normalized.push(":emoji");
            break;
        }

        if segment == "webhooks"
            && index + 2 < segments.len()
            && is_snowflake(segments[index + 1])
            && !segments[index + 2].is_empty()
        {
            normalized.push(":id");
            normalized.push(":token");
            index += 3;
            continue;
        }

        index += 1;
    }

    normalized.join("/")
}

/// Bucket key for a request: `METHOD:normalized-path`
pub fn route_key(method: &Method, endpoint: &str) -> String {
    format!("{}:{}", method, normalize_route(endpoint))
}
