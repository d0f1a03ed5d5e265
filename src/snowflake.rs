use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// Platform epoch: 2015-01-01T00:00:00Z
const EPOCH: u64 = 1_420_070_400_000;

/// A 64-bit platform id. Upper 42 bits are milliseconds since `EPOCH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Snowflake(pub u64);

impl Snowflake {
    pub fn get(self) -> u64 {
        self.0
    }

    /// Unix timestamp in milliseconds at which the id was minted.
    pub fn timestamp_ms(self) -> u64 {
        (self.0 >> 22) + EPOCH
    }

    pub fn created_at(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp_ms() as i64).single()
    }
}

impl From<u64> for Snowflake {
    fn from(id: u64) -> Self {
        Snowflake(id)
    }
}

impl FromStr for Snowflake {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Snowflake)
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Ids travel as JSON strings, but numbers are accepted too.
impl Serialize for Snowflake {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Number(n) => Ok(Snowflake(n)),
        }
    }
}

/// Creation timestamp (unix ms) of a textual id, if it parses.
pub fn timestamp_of(id: &str) -> Option<u64> {
    id.parse::<Snowflake>().ok().map(Snowflake::timestamp_ms)
}
