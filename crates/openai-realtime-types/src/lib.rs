//! Serde models for the subset of the OpenAI Realtime protocol used by walkie.
pub mod audio;
pub mod events;
pub mod session;
pub mod tools;
mod content;

// re-export the types most callers need
pub use content::items::{FunctionCallOutputItem, Item};
pub use content::message::*;
pub use events::{ClientEvent, ServerEvent};
pub use session::Session;
