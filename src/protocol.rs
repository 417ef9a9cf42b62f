//! Gateway wire protocol
//!
//! Op codes, close codes and the `{op, d, s, t}` frame format. Dispatch
//! bodies are kept as opaque JSON; typed decoding belongs to the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Gateway operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Server dispatches an event
    Dispatch = 0,
    /// Keep the session alive (both directions)
    Heartbeat = 1,
    /// Start a new session
    Identify = 2,
    /// Update the client's presence
    PresenceUpdate = 3,
    /// Join, move or leave voice channels
    VoiceStateUpdate = 4,
    /// Re-attach to a previous session
    Resume = 6,
    /// Server asks the client to reconnect
    Reconnect = 7,
    /// Request members of a guild
    RequestGuildMembers = 8,
    /// Session was invalidated
    InvalidSession = 9,
    /// First frame on every connection, carries the heartbeat interval
    Hello = 10,
    /// Heartbeat acknowledged
    HeartbeatAck = 11,
}

impl OpCode {
    /// Create an `OpCode` from a raw integer value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::PresenceUpdate),
            4 => Some(Self::VoiceStateUpdate),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            8 => Some(Self::RequestGuildMembers),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    /// Get the raw integer value
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Gateway close event codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    UnknownError = 4000,
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    InvalidSequence = 4007,
    RateLimited = 4008,
    SessionTimedOut = 4009,
    InvalidShard = 4010,
    ShardingRequired = 4011,
    InvalidApiVersion = 4012,
    InvalidIntents = 4013,
    DisallowedIntents = 4014,
}

impl CloseCode {
    /// Create a `CloseCode` from a raw u16 value
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            4000 => Some(Self::UnknownError),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4007 => Some(Self::InvalidSequence),
            4008 => Some(Self::RateLimited),
            4009 => Some(Self::SessionTimedOut),
            4010 => Some(Self::InvalidShard),
            4011 => Some(Self::ShardingRequired),
            4012 => Some(Self::InvalidApiVersion),
            4013 => Some(Self::InvalidIntents),
            4014 => Some(Self::DisallowedIntents),
            _ => None,
        }
    }

    /// Get the raw u16 value
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the description for this close code
    pub const fn description(self) -> &'static str {
        match self {
            Self::UnknownError => "Unknown error",
            Self::UnknownOpcode => "Unknown opcode",
            Self::DecodeError => "Decode error",
            Self::NotAuthenticated => "Not authenticated",
            Self::AuthenticationFailed => "Authentication failed",
            Self::AlreadyAuthenticated => "Already authenticated",
            Self::InvalidSequence => "Invalid sequence",
            Self::RateLimited => "Rate limited",
            Self::SessionTimedOut => "Session timed out",
            Self::InvalidShard => "Invalid shard",
            Self::ShardingRequired => "Sharding required",
            Self::InvalidApiVersion => "Invalid API version",
            Self::InvalidIntents => "Invalid intents",
            Self::DisallowedIntents => "Disallowed intents",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_u16())
    }
}

/// Close code sent when the session should stay resumable.
pub const RESUMABLE_CLOSE_CODE: u16 = 4000;

/// Close code sent when the session is abandoned.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// What a shard does after the gateway closes its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Reconnect, resuming if a session is still held
    Reconnect,
    /// Reconnect after dropping the stored sequence
    ReconnectWithoutSequence,
    /// Reconnect after forgetting the session; the next connect identifies
    ReconnectFresh,
    /// Reconnect with the send window forced empty
    ReconnectThrottled,
    /// Tear down and surface the error; never reconnect
    Fatal,
}

impl CloseDisposition {
    /// Classify a raw close code. Unrecognized codes reconnect.
    pub fn for_code(code: u16) -> Self {
        match CloseCode::from_u16(code) {
            Some(CloseCode::InvalidSequence) => Self::ReconnectWithoutSequence,
            Some(CloseCode::SessionTimedOut) => Self::ReconnectFresh,
            Some(CloseCode::RateLimited) => Self::ReconnectThrottled,
            Some(
                CloseCode::AuthenticationFailed
                | CloseCode::InvalidShard
                | CloseCode::ShardingRequired
                | CloseCode::InvalidApiVersion
                | CloseCode::InvalidIntents
                | CloseCode::DisallowedIntents,
            ) => Self::Fatal,
            _ => Self::Reconnect,
        }
    }
}

/// A single gateway frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    /// Raw operation code
    pub op: u8,

    /// Event data
    #[serde(default)]
    pub d: Value,

    /// Sequence number (dispatch only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,

    /// Event name (dispatch only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// Build an outbound frame
    pub fn new(op: OpCode, d: Value) -> Self {
        Self {
            op: op.as_u8(),
            d,
            s: None,
            t: None,
        }
    }

    /// Heartbeat carrying the last seen sequence
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::new(OpCode::Heartbeat, sequence.map_or(Value::Null, Value::from))
    }

    pub fn identify(identify: &Identify) -> Result<Self, serde_json::Error> {
        Ok(Self::new(OpCode::Identify, serde_json::to_value(identify)?))
    }

    pub fn resume(resume: &Resume) -> Result<Self, serde_json::Error> {
        Ok(Self::new(OpCode::Resume, serde_json::to_value(resume)?))
    }

    /// Request guild members matching `query` (empty matches everyone)
    pub fn request_guild_members(guild_id: u64, query: &str, limit: u32) -> Self {
        Self::new(
            OpCode::RequestGuildMembers,
            serde_json::json!({
                "guild_id": guild_id.to_string(),
                "query": query,
                "limit": limit,
            }),
        )
    }

    /// Decoded op code, `None` for codes this client does not know
    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.op)
    }
}

/// Body of an Identify frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    pub token: String,
    pub intents: u64,
    pub properties: IdentifyProperties,
    pub compress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
}

/// Client identity reported on identify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Body of a Resume frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}

/// Body of a Hello frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Hello {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

impl Hello {
    /// Heartbeat interval, rejecting zero
    pub fn interval(&self) -> Result<std::time::Duration, serde_json::Error> {
        if self.heartbeat_interval == 0 {
            return Err(serde::de::Error::custom("heartbeat_interval must be positive"));
        }
        Ok(std::time::Duration::from_millis(self.heartbeat_interval))
    }
}

/// Fields of the READY dispatch the session needs
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// A dispatch event handed to the caller undecoded
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    /// Event name, e.g. `MESSAGE_CREATE`
    pub name: String,
    /// Sequence number of this event
    pub sequence: Option<u64>,
    /// Raw event body
    pub data: Value,
}

/// Response of the gateway bootstrap call
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// Identify budget reported by the bootstrap call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SessionStartLimit {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub remaining: u32,
    /// Milliseconds until the budget resets
    #[serde(default)]
    pub reset_after: u64,
    /// Shards that may identify concurrently
    pub max_concurrency: u32,
}
