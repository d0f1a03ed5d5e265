use crate::error::ConfigError;

pub const GUILDS: u64 = 1 << 0;
pub const GUILD_MEMBERS: u64 = 1 << 1;
pub const GUILD_BANS: u64 = 1 << 2;
pub const GUILD_EMOJIS_AND_STICKERS: u64 = 1 << 3;
pub const GUILD_INTEGRATIONS: u64 = 1 << 4;
pub const GUILD_WEBHOOKS: u64 = 1 << 5;
pub const GUILD_INVITES: u64 = 1 << 6;
pub const GUILD_VOICE_STATES: u64 = 1 << 7;
pub const GUILD_PRESENCES: u64 = 1 << 8;
pub const GUILD_MESSAGES: u64 = 1 << 9;
pub const GUILD_MESSAGE_REACTIONS: u64 = 1 << 10;
pub const GUILD_MESSAGE_TYPING: u64 = 1 << 11;
pub const DIRECT_MESSAGES: u64 = 1 << 12;
pub const DIRECT_MESSAGE_REACTIONS: u64 = 1 << 13;
pub const DIRECT_MESSAGE_TYPING: u64 = 1 << 14;
pub const GUILD_SCHEDULED_EVENTS: u64 = 1 << 16;

/// All known intents by name.
pub const ALL_INTENTS: &[(&str, u64)] = &[
    ("GUILDS", GUILDS),
    ("GUILD_MEMBERS", GUILD_MEMBERS),
    ("GUILD_BANS", GUILD_BANS),
    ("GUILD_EMOJIS_AND_STICKERS", GUILD_EMOJIS_AND_STICKERS),
    ("GUILD_INTEGRATIONS", GUILD_INTEGRATIONS),
    ("GUILD_WEBHOOKS", GUILD_WEBHOOKS),
    ("GUILD_INVITES", GUILD_INVITES),
    ("GUILD_VOICE_STATES", GUILD_VOICE_STATES),
    ("GUILD_PRESENCES", GUILD_PRESENCES),
    ("GUILD_MESSAGES", GUILD_MESSAGES),
    ("GUILD_MESSAGE_REACTIONS", GUILD_MESSAGE_REACTIONS),
    ("GUILD_MESSAGE_TYPING", GUILD_MESSAGE_TYPING),
    ("DIRECT_MESSAGES", DIRECT_MESSAGES),
    ("DIRECT_MESSAGE_REACTIONS", DIRECT_MESSAGE_REACTIONS),
    ("DIRECT_MESSAGE_TYPING", DIRECT_MESSAGE_TYPING),
    ("GUILD_SCHEDULED_EVENTS", GUILD_SCHEDULED_EVENTS),
];

pub const PRIVILEGED_INTENTS: u64 = GUILD_MEMBERS | GUILD_PRESENCES;

pub fn all() -> u64 {
    ALL_INTENTS.iter().fold(0, |acc, (_, bit)| acc | bit)
}

/// Every intent except the privileged ones.
pub fn standard() -> u64 {
    all() & !PRIVILEGED_INTENTS
}

/// Parse either a raw bitfield (`"513"`) or a comma separated list of names
/// (`"guilds, guild_messages"`).
pub fn parse(value: &str) -> Result<u64, ConfigError> {
    let value = value.trim();
    if let Ok(bits) = value.parse::<u64>() {
        return Ok(bits);
    }

    let mut bits = 0;
    for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let upper = name.to_ascii_uppercase();
        let bit = match upper.as_str() {
            "ALL" => all(),
            "STANDARD" => standard(),
            _ => ALL_INTENTS
                .iter()
                .find(|(n, _)| *n == upper)
                .map(|(_, bit)| *bit)
                .ok_or_else(|| ConfigError::UnknownIntent(name.to_string()))?,
        };
        bits |= bit;
    }
    Ok(bits)
}

/// Map a dispatch event name to the intent that enables it.
pub fn intent_for_event(event_name: &str) -> Option<u64> {
    match event_name {
        "GUILD_CREATE" | "GUILD_UPDATE" | "GUILD_DELETE" | "GUILD_ROLE_CREATE"
        | "GUILD_ROLE_UPDATE" | "GUILD_ROLE_DELETE" | "CHANNEL_CREATE" | "CHANNEL_UPDATE"
        | "CHANNEL_DELETE" | "CHANNEL_PINS_UPDATE" | "THREAD_CREATE" | "THREAD_UPDATE"
        | "THREAD_DELETE" => Some(GUILDS),
        "GUILD_MEMBER_ADD" | "GUILD_MEMBER_UPDATE" | "GUILD_MEMBER_REMOVE" => Some(GUILD_MEMBERS),
        "GUILD_BAN_ADD" | "GUILD_BAN_REMOVE" => Some(GUILD_BANS),
        "GUILD_EMOJIS_UPDATE" | "GUILD_STICKERS_UPDATE" => Some(GUILD_EMOJIS_AND_STICKERS),
        "GUILD_INTEGRATIONS_UPDATE" => Some(GUILD_INTEGRATIONS),
        "WEBHOOKS_UPDATE" => Some(GUILD_WEBHOOKS),
        "INVITE_CREATE" | "INVITE_DELETE" => Some(GUILD_INVITES),
        "VOICE_STATE_UPDATE" => Some(GUILD_VOICE_STATES),
        "PRESENCE_UPDATE" => Some(GUILD_PRESENCES),
        // Direct messages arrive under the same names; either intent is enough.
        "MESSAGE_CREATE" | "MESSAGE_UPDATE" | "MESSAGE_DELETE" | "MESSAGE_DELETE_BULK" => {
            Some(GUILD_MESSAGES | DIRECT_MESSAGES)
        }
        "MESSAGE_REACTION_ADD" | "MESSAGE_REACTION_REMOVE" | "MESSAGE_REACTION_REMOVE_ALL"
        | "MESSAGE_REACTION_REMOVE_EMOJI" => {
            Some(GUILD_MESSAGE_REACTIONS | DIRECT_MESSAGE_REACTIONS)
        }
        "TYPING_START" => Some(GUILD_MESSAGE_TYPING | DIRECT_MESSAGE_TYPING),
        "GUILD_SCHEDULED_EVENT_CREATE"
        | "GUILD_SCHEDULED_EVENT_UPDATE"
        | "GUILD_SCHEDULED_EVENT_DELETE" => Some(GUILD_SCHEDULED_EVENTS),
        _ => None,
    }
}

/// Check whether the declared intents can ever deliver an event.
pub fn has_intent(intents: u64, event_name: &str) -> bool {
    match intent_for_event(event_name) {
        Some(required) => intents & required != 0,
        None => true, // READY, RESUMED and friends are always delivered
    }
}
