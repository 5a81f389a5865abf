mod client;

pub use client::config::{Config, ConfigBuilder};
pub use client::stats::Stats;
pub use client::{Client, ClientTx, OAIClient, ServerRx, connect, connect_with_config};
pub use openai_realtime_types as types;
