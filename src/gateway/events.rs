use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snowflake::Snowflake;

/// Opcodes for gateway messages.
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const PRESENCE_UPDATE: u8 = 3;
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Close codes.
pub mod close_code {
    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const INVALID_SEQ: u16 = 4007;
    pub const RATE_LIMITED: u16 = 4008;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_API_VERSION: u16 = 4012;
    pub const INVALID_INTENTS: u16 = 4013;
    pub const DISALLOWED_INTENTS: u16 = 4014;

    /// Codes after which reconnecting can never succeed.
    pub fn is_fatal(code: u16) -> bool {
        matches!(
            code,
            AUTHENTICATION_FAILED
                | INVALID_SHARD
                | SHARDING_REQUIRED
                | INVALID_API_VERSION
                | INVALID_INTENTS
                | DISALLOWED_INTENTS
        )
    }

    /// Codes after which the session cannot be resumed.
    pub fn invalidates_session(code: u16) -> bool {
        matches!(code, INVALID_SEQ | SESSION_TIMED_OUT)
    }
}

/// Gateway message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Option<Value>,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: u8, d: Value) -> Self {
        Self {
            op,
            d: Some(d),
            s: None,
            t: None,
        }
    }
}

/// HELLO (opcode 10) payload data.
#[derive(Debug, Deserialize)]
pub struct HelloData {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "bhaicord".to_string(),
            device: "bhaicord".to_string(),
        }
    }
}

/// IDENTIFY (opcode 2) payload data.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyData {
    pub token: String,
    pub intents: u64,
    pub properties: ConnectionProperties,
    pub presence: Option<Value>,
}

/// RESUME (opcode 6) payload data.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeData {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}

pub fn identify(token: &str, intents: u64, properties: &ConnectionProperties) -> GatewayPayload {
    let data = IdentifyData {
        token: token.to_string(),
        intents,
        properties: properties.clone(),
        presence: None,
    };
    GatewayPayload::new(opcode::IDENTIFY, serde_json::json!(data))
}

pub fn resume(token: &str, session_id: &str, seq: Option<u64>) -> GatewayPayload {
    let data = ResumeData {
        token: token.to_string(),
        session_id: session_id.to_string(),
        seq,
    };
    GatewayPayload::new(opcode::RESUME, serde_json::json!(data))
}

pub fn heartbeat(seq: Option<u64>) -> GatewayPayload {
    GatewayPayload::new(opcode::HEARTBEAT, serde_json::json!(seq))
}

/// Partial user as delivered in READY.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyUser {
    pub id: Snowflake,
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnavailableGuild {
    pub id: Snowflake,
}

/// READY dispatch data.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyEvent {
    #[serde(rename = "v")]
    pub gateway_version: u8,
    pub user: ReadyUser,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub shard: Option<Vec<u32>>,
}

/// TYPING_START dispatch data.
#[derive(Debug, Clone, Deserialize)]
pub struct TypingStartEvent {
    pub channel_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    pub user_id: Snowflake,
    pub timestamp: i64,
    #[serde(default)]
    pub member: Option<Value>,
}

impl TypingStartEvent {
    pub fn started_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(self.timestamp, 0)
    }
}

/// A decoded dispatch event. Entities owned by the data-model layer are
/// carried as raw JSON.
#[derive(Debug, Clone)]
pub enum Event {
    Ready(Box<ReadyEvent>),
    Resumed,
    TypingStart(TypingStartEvent),
    MessageCreate(Value),
    MessageUpdate(Value),
    MessageDelete(Value),
    GuildCreate(Value),
    ChannelCreate(Value),
    ChannelUpdate(Value),
    ChannelDelete(Value),
    Unknown { name: String, data: Value },
}

impl Event {
    /// Build the typed event for a dispatch name and payload.
    pub fn from_dispatch(name: &str, data: Value) -> Result<Self, serde_json::Error> {
        let event = match name {
            "READY" => Event::Ready(Box::new(serde_json::from_value(data)?)),
            "RESUMED" => Event::Resumed,
            "TYPING_START" => Event::TypingStart(serde_json::from_value(data)?),
            "MESSAGE_CREATE" => Event::MessageCreate(data),
            "MESSAGE_UPDATE" => Event::MessageUpdate(data),
            "MESSAGE_DELETE" => Event::MessageDelete(data),
            "GUILD_CREATE" => Event::GuildCreate(data),
            "CHANNEL_CREATE" => Event::ChannelCreate(data),
            "CHANNEL_UPDATE" => Event::ChannelUpdate(data),
            "CHANNEL_DELETE" => Event::ChannelDelete(data),
            _ => Event::Unknown {
                name: name.to_string(),
                data,
            },
        };
        Ok(event)
    }

    pub fn name(&self) -> &str {
        match self {
            Event::Ready(_) => "READY",
            Event::Resumed => "RESUMED",
            Event::TypingStart(_) => "TYPING_START",
            Event::MessageCreate(_) => "MESSAGE_CREATE",
            Event::MessageUpdate(_) => "MESSAGE_UPDATE",
            Event::MessageDelete(_) => "MESSAGE_DELETE",
            Event::GuildCreate(_) => "GUILD_CREATE",
            Event::ChannelCreate(_) => "CHANNEL_CREATE",
            Event::ChannelUpdate(_) => "CHANNEL_UPDATE",
            Event::ChannelDelete(_) => "CHANNEL_DELETE",
            Event::Unknown { name, .. } => name,
        }
    }

    /// Raw JSON for events that are not decoded further.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Event::MessageCreate(d)
            | Event::MessageUpdate(d)
            | Event::MessageDelete(d)
            | Event::GuildCreate(d)
            | Event::ChannelCreate(d)
            | Event::ChannelUpdate(d)
            | Event::ChannelDelete(d) => Some(d),
            Event::Unknown { data, .. } => Some(data),
            _ => None,
        }
    }
}
