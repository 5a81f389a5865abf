pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";

pub const BASE_URL: &str = "wss://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const OPENAI_BETA_HEADER: &str = "OpenAI-Beta";

/// Default capacity of the client and server event channels.
pub const DEFAULT_CAPACITY: usize = 1024;
