pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod snowflake;

pub use cache::EntityCache;
pub use client::Client;
pub use config::Config;
pub use error::{GatewayError, Result};
pub use gateway::events::Event;
pub use gateway::session::ConnectionState;
pub use snowflake::Snowflake;
